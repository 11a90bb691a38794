//! Service cluster collaborator
//!
//! Runs tasks for a named service and reports their health. The deploy
//! executor drives a rollout entirely through this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipway_core::domain::service::{TargetService, TaskDefinition};
use shipway_core::error::DeployError;

use crate::collaborator::registry::RegistryError;

/// Identifier of a running task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of a task as seen by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskHealth {
    /// Started, not yet passing health checks
    Pending,
    Healthy,
    /// Stopped or failing for good
    Unhealthy,
}

/// One task of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: TaskId,
    /// Task definition revision the task runs
    pub revision: u32,
    pub image: String,
    pub health: TaskHealth,
}

/// Observed state of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub task_definition: TaskDefinition,
    pub desired_count: u32,
    /// Tasks the service currently routes traffic to
    pub tasks: Vec<TaskState>,
}

impl ServiceState {
    pub fn healthy_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.health == TaskHealth::Healthy)
            .count()
    }
}

/// Cluster that hosts the target service
#[async_trait]
pub trait ServiceCluster: Send + Sync {
    /// Current state of a service
    async fn describe_service(&self, service: &TargetService) -> Result<ServiceState, DeployError>;

    /// Registers a new task definition revision and returns it with its
    /// assigned revision number
    async fn register_task_definition(
        &self,
        definition: &TaskDefinition,
    ) -> Result<TaskDefinition, DeployError>;

    /// Starts one task of the given definition, pulling its image as the
    /// service's execution identity
    async fn start_task(
        &self,
        service: &TargetService,
        definition: &TaskDefinition,
    ) -> Result<TaskId, DeployError>;

    async fn task_health(&self, task: &TaskId) -> Result<TaskHealth, DeployError>;

    /// Stops a task and removes it from the service
    async fn stop_task(&self, task: &TaskId) -> Result<(), DeployError>;

    /// Points the service at a definition and replaces its task set
    async fn update_service(
        &self,
        service: &TargetService,
        definition: &TaskDefinition,
        tasks: &[TaskId],
    ) -> Result<(), DeployError>;
}

/// Maps a failed image pull while starting a task to a deploy error
pub fn pull_failure(err: RegistryError) -> DeployError {
    match &err {
        RegistryError::Denied { .. } => DeployError::ImagePullDenied(err.to_string()),
        _ => DeployError::RolloutFailed(err.to_string()),
    }
}
