//! Container image references

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fully qualified image reference: `<registry host>/<repository>:<tag>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry_host: String,
    pub repository: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid image reference '{0}'")]
pub struct InvalidImageRef(pub String);

impl ImageRef {
    pub fn new(
        registry_host: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry_host: registry_host.into(),
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Registry host of an ECR repository
    pub fn ecr_host(account: &str, region: &str) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com", account, region)
    }

    /// Parses `host/repository:tag`
    ///
    /// The host is the first path segment; the tag follows the last colon
    /// after it, so hosts with ports (`localhost:5000/app:v1`) parse.
    pub fn parse(input: &str) -> Result<Self, InvalidImageRef> {
        let invalid = || InvalidImageRef(input.to_string());

        let (host, rest) = input.split_once('/').ok_or_else(invalid)?;
        let (repository, tag) = rest.rsplit_once(':').ok_or_else(invalid)?;

        if host.is_empty() || repository.is_empty() || tag.is_empty() || tag.contains('/') {
            return Err(invalid());
        }

        Ok(Self::new(host, repository, tag))
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry_host, self.repository, self.tag)
    }
}

/// One entry of the image definitions document produced by a build
///
/// The build artifact is a JSON array of these, naming the new image for
/// each container of the target service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    pub name: String,
    #[serde(rename = "imageUri")]
    pub image_uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecr_image_display() {
        let image = ImageRef::new(ImageRef::ecr_host("acct", "us-west-2"), "veengu-back", "abc123");
        assert_eq!(
            image.to_string(),
            "acct.dkr.ecr.us-west-2.amazonaws.com/veengu-back:abc123"
        );
    }

    #[test]
    fn test_parse_with_port() {
        let image = ImageRef::parse("localhost:5000/team/app:v1").unwrap();
        assert_eq!(image.registry_host, "localhost:5000");
        assert_eq!(image.repository, "team/app");
        assert_eq!(image.tag, "v1");
    }

    #[test]
    fn test_parse_rejects_missing_tag() {
        assert!(ImageRef::parse("localhost/app").is_err());
        assert!(ImageRef::parse("app:v1").is_err());
    }

    #[test]
    fn test_image_definition_json_shape() {
        let def = ImageDefinition {
            name: "web".to_string(),
            image_uri: "host/app:1".to_string(),
        };
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json, serde_json::json!({"name": "web", "imageUri": "host/app:1"}));
    }
}
