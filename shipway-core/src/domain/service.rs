//! Target service domain model
//!
//! The cluster-managed service that deploys roll new images out to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::grant::Principal;

/// Default time a new task gets to pass health checks
pub const DEFAULT_HEALTH_CHECK_GRACE_SECONDS: u64 = 60;

/// Container running inside a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub port: u16,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Versioned description of the task a service runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub family: String,
    pub revision: u32,
    pub container: ContainerDefinition,
}

impl TaskDefinition {
    /// `family:revision`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.family, self.revision)
    }

    /// Copy of this definition pointing the container at a new image
    ///
    /// The revision is left unchanged; the cluster assigns the next one on
    /// registration.
    pub fn with_image(&self, image: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.container.image = image.into();
        next
    }
}

/// Service that deploys affect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetService {
    pub cluster: String,
    pub name: String,
    pub task_definition: TaskDefinition,
    pub desired_count: u32,
    /// Identity the cluster uses to pull images for this service
    pub execution_identity: Principal,
    pub health_check_grace_seconds: u64,
    /// Stable external endpoint name (DNS record in front of the load balancer)
    pub endpoint: Option<String>,
}

impl TargetService {
    pub fn health_check_grace_period(&self) -> Duration {
        Duration::from_secs(self.health_check_grace_seconds)
    }

    pub fn container_name(&self) -> &str {
        &self.task_definition.container.name
    }

    pub fn container_port(&self) -> u16 {
        self.task_definition.container.port
    }
}
