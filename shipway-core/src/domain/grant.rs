//! Grant domain types
//!
//! A grant binds a principal (an executor identity) to a shared resource
//! with a set of permissions. Grants only ever accumulate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity an executor acts as when touching shared resources
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared resource a grant applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "name")]
pub enum Resource {
    /// Image registry repository, identified by its name
    Registry(String),

    /// Service cluster, identified by its name
    Cluster(String),
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Registry(name) => write!(f, "registry/{}", name),
            Resource::Cluster(name) => write!(f, "cluster/{}", name),
        }
    }
}

/// Operation a principal may perform on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    Pull,
    Push,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::Pull => write!(f, "pull"),
            Permission::Push => write!(f, "push"),
        }
    }
}

/// Effective permissions of one principal on one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub principal: Principal,
    pub resource: Resource,
    pub permissions: BTreeSet<Permission>,
}

impl Grant {
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_display() {
        assert_eq!(
            Resource::Registry("veengu-back".to_string()).to_string(),
            "registry/veengu-back"
        );
        assert_eq!(
            Resource::Cluster("fargate".to_string()).to_string(),
            "cluster/fargate"
        );
    }

    #[test]
    fn test_grant_allows() {
        let grant = Grant {
            principal: Principal::new("builder"),
            resource: Resource::Registry("app".to_string()),
            permissions: BTreeSet::from([Permission::Pull]),
        };
        assert!(grant.allows(Permission::Pull));
        assert!(!grant.allows(Permission::Push));
    }
}
