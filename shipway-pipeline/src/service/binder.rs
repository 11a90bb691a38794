//! Access policy binder
//!
//! Grants executor principals the permissions they need on shared
//! resources. Grants are additive and idempotent: asking for permissions a
//! principal already holds changes nothing and never touches the resource.

use shipway_core::domain::grant::{Grant, Permission, Principal, Resource};
use shipway_core::error::GrantError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::collaborator::registry::GrantTarget;

pub struct AccessPolicyBinder {
    targets: HashMap<Resource, Arc<dyn GrantTarget>>,
    grants: RwLock<BTreeMap<(Principal, Resource), BTreeSet<Permission>>>,
}

impl Default for AccessPolicyBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessPolicyBinder {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
            grants: RwLock::new(BTreeMap::new()),
        }
    }

    /// Makes a resource available for grants
    pub fn register(&mut self, target: Arc<dyn GrantTarget>) {
        self.targets.insert(target.resource(), target);
    }

    /// Grants permissions on a resource
    ///
    /// Only permissions the principal does not already hold are applied to
    /// the resource. Returns the effective grant afterwards.
    ///
    /// # Errors
    /// `Unauthorized` if the resource is unknown or refuses the grant.
    pub async fn grant(
        &self,
        principal: &Principal,
        resource: &Resource,
        permissions: &[Permission],
    ) -> Result<Grant, GrantError> {
        let target = self
            .targets
            .get(resource)
            .ok_or_else(|| GrantError::Unauthorized {
                principal: principal.clone(),
                resource: resource.clone(),
                reason: "resource is not managed by this binder".to_string(),
            })?;

        let held = self.effective(principal, resource);
        let missing: BTreeSet<Permission> = permissions
            .iter()
            .copied()
            .filter(|p| !held.contains(p))
            .collect();

        if missing.is_empty() {
            debug!("{} already holds {:?} on {}", principal, permissions, resource);
            return Ok(self.grant_of(principal, resource));
        }

        target.apply_grant(principal, &missing).await?;

        self.grants
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry((principal.clone(), resource.clone()))
            .or_default()
            .extend(missing.iter().copied());

        info!("Granted {:?} on {} to {}", missing, resource, principal);
        Ok(self.grant_of(principal, resource))
    }

    /// Permissions a principal holds on a resource
    pub fn effective(&self, principal: &Principal, resource: &Resource) -> BTreeSet<Permission> {
        self.grants
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(principal.clone(), resource.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Every grant made so far
    pub fn grants(&self) -> Vec<Grant> {
        self.grants
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|((principal, resource), permissions)| Grant {
                principal: principal.clone(),
                resource: resource.clone(),
                permissions: permissions.clone(),
            })
            .collect()
    }

    fn grant_of(&self, principal: &Principal, resource: &Resource) -> Grant {
        Grant {
            principal: principal.clone(),
            resource: resource.clone(),
            permissions: self.effective(principal, resource),
        }
    }
}
