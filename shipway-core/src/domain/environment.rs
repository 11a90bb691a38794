//! Build environment configuration
//!
//! A closed set of plain key/value pairs resolved once when the deployment
//! topology is constructed and injected verbatim into every build.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const ACCOUNT_ID: &str = "AWS_ACCOUNT_ID";
pub const REGION: &str = "AWS_DEFAULT_REGION";
pub const CONTAINER_PORT: &str = "CONTAINER_PORT";
pub const CONTAINER_NAME: &str = "CONTAINER_NAME";
pub const IMAGE_NAME: &str = "IMAGE_NAME";
pub const REGISTRY_HOST: &str = "REGISTRY_HOST";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("environment key cannot be empty")]
    EmptyKey,

    #[error("environment value for '{0}' cannot be empty")]
    EmptyValue(String),

    #[error("environment key '{0}' is defined twice")]
    DuplicateKey(String),
}

/// Environment variables exposed to the build process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentConfig {
    vars: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    /// Builds a configuration, rejecting empty keys, empty values and duplicates
    pub fn new<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Result<Self, EnvironmentError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in vars {
            let key = key.into();
            let value = value.into();

            if key.trim().is_empty() {
                return Err(EnvironmentError::EmptyKey);
            }
            if value.is_empty() {
                return Err(EnvironmentError::EmptyValue(key));
            }
            if map.insert(key.clone(), value).is_some() {
                return Err(EnvironmentError::DuplicateKey(key));
            }
        }

        Ok(Self { vars: map })
    }

    /// Standard deployment-wide configuration
    pub fn for_deployment(
        account: &str,
        region: &str,
        container_port: u16,
        container_name: &str,
        image_name: &str,
        registry_host: &str,
    ) -> Result<Self, EnvironmentError> {
        Self::new([
            (ACCOUNT_ID, account.to_string()),
            (REGION, region.to_string()),
            (CONTAINER_PORT, container_port.to_string()),
            (CONTAINER_NAME, container_name.to_string()),
            (IMAGE_NAME, image_name.to_string()),
            (REGISTRY_HOST, registry_host.to_string()),
        ])
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}
