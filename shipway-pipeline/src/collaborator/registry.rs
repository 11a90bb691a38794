//! Image registry collaborator
//!
//! The registry is both where builds push images and where the cluster pulls
//! them from. Access is decided per principal by a [`RegistryPolicy`] that the
//! access policy binder extends through [`GrantTarget`].

use async_trait::async_trait;
use shipway_core::domain::grant::{Permission, Principal, Resource};
use shipway_core::domain::image::ImageRef;
use shipway_core::error::GrantError;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::podman;

/// Failure talking to the image registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{principal} may not {permission} {image}")]
    Denied {
        principal: Principal,
        permission: Permission,
        image: String,
    },

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("registry operation failed: {0}")]
    Failed(String),
}

/// Shared resource that accepts permission grants
#[async_trait]
pub trait GrantTarget: Send + Sync {
    /// Resource this target represents
    fn resource(&self) -> Resource;

    /// Adds permissions for a principal
    ///
    /// Must be additive: permissions already held are never removed.
    async fn apply_grant(
        &self,
        principal: &Principal,
        permissions: &BTreeSet<Permission>,
    ) -> Result<(), GrantError>;
}

/// Push and pull access to an image repository
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Publishes a locally built image
    async fn push(&self, principal: &Principal, image: &ImageRef) -> Result<(), RegistryError>;

    /// Fetches an image so it can be run
    async fn pull(&self, principal: &Principal, image: &ImageRef) -> Result<(), RegistryError>;
}

/// Per-principal permissions on one repository
#[derive(Debug, Default)]
pub struct RegistryPolicy {
    permissions: RwLock<HashMap<Principal, BTreeSet<Permission>>>,
}

impl RegistryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds permissions, keeping those already held
    pub fn allow(&self, principal: &Principal, permissions: &BTreeSet<Permission>) {
        let mut map = self
            .permissions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(principal.clone())
            .or_default()
            .extend(permissions.iter().copied());
    }

    /// Checks that a principal holds a permission
    pub fn check(
        &self,
        principal: &Principal,
        permission: Permission,
        image: &ImageRef,
    ) -> Result<(), RegistryError> {
        let map = self
            .permissions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let allowed = map
            .get(principal)
            .is_some_and(|set| set.contains(&permission));

        if allowed {
            Ok(())
        } else {
            Err(RegistryError::Denied {
                principal: principal.clone(),
                permission,
                image: image.to_string(),
            })
        }
    }

    pub fn permissions_of(&self, principal: &Principal) -> BTreeSet<Permission> {
        self.permissions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(principal)
            .cloned()
            .unwrap_or_default()
    }
}

/// Registry reached through the local podman installation
///
/// Principals are mapped to the policy only; podman itself pushes with
/// whatever credentials `podman login` stored for the host.
pub struct PodmanRegistry {
    repository: String,
    tls_verify: bool,
    policy: RegistryPolicy,
}

impl PodmanRegistry {
    pub fn new(repository: impl Into<String>, tls_verify: bool) -> Self {
        Self {
            repository: repository.into(),
            tls_verify,
            policy: RegistryPolicy::new(),
        }
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    fn tls_flag(&self) -> Option<&'static str> {
        if self.tls_verify {
            None
        } else {
            Some("--tls-verify=false")
        }
    }

    async fn transfer(&self, verb: &str, image: &ImageRef) -> Result<(), RegistryError> {
        let reference = image.to_string();
        let mut args = vec![verb];
        if let Some(flag) = self.tls_flag() {
            args.push(flag);
        }
        args.push(&reference);

        let output = podman::podman(&args)
            .await
            .map_err(|e| RegistryError::Failed(format!("{:#}", e)))?;

        if output.success() {
            return Ok(());
        }

        let stderr = output.stderr.to_lowercase();
        if stderr.contains("manifest unknown") || stderr.contains("not found") {
            Err(RegistryError::NotFound(reference))
        } else {
            Err(RegistryError::Failed(output.describe()))
        }
    }
}

#[async_trait]
impl ImageRegistry for PodmanRegistry {
    async fn push(&self, principal: &Principal, image: &ImageRef) -> Result<(), RegistryError> {
        self.policy.check(principal, Permission::Push, image)?;
        info!("Pushing {} as {}", image, principal);
        self.transfer("push", image).await
    }

    async fn pull(&self, principal: &Principal, image: &ImageRef) -> Result<(), RegistryError> {
        self.policy.check(principal, Permission::Pull, image)?;
        debug!("Pulling {} as {}", image, principal);
        self.transfer("pull", image).await
    }
}

#[async_trait]
impl GrantTarget for PodmanRegistry {
    fn resource(&self) -> Resource {
        Resource::Registry(self.repository.clone())
    }

    async fn apply_grant(
        &self,
        principal: &Principal,
        permissions: &BTreeSet<Permission>,
    ) -> Result<(), GrantError> {
        self.policy.allow(principal, permissions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ImageRef {
        ImageRef::new("localhost:5000", "app", "abc123")
    }

    #[test]
    fn test_policy_denies_by_default() {
        let policy = RegistryPolicy::new();
        let result = policy.check(&Principal::new("builder"), Permission::Push, &image());
        assert!(matches!(result, Err(RegistryError::Denied { .. })));
    }

    #[test]
    fn test_policy_allow_is_additive() {
        let policy = RegistryPolicy::new();
        let builder = Principal::new("builder");

        policy.allow(&builder, &BTreeSet::from([Permission::Pull]));
        policy.allow(&builder, &BTreeSet::from([Permission::Push]));

        assert!(policy.check(&builder, Permission::Pull, &image()).is_ok());
        assert!(policy.check(&builder, Permission::Push, &image()).is_ok());
        assert_eq!(policy.permissions_of(&builder).len(), 2);
    }

    #[test]
    fn test_podman_registry_resource() {
        let registry = PodmanRegistry::new("veengu-back", true);
        assert_eq!(
            registry.resource(),
            Resource::Registry("veengu-back".to_string())
        );
        assert_eq!(registry.tls_flag(), None);
        assert_eq!(
            PodmanRegistry::new("app", false).tls_flag(),
            Some("--tls-verify=false")
        );
    }
}
