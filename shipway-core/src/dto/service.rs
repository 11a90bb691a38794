//! Target service DTOs

use serde::{Deserialize, Serialize};

/// One task of the target service as reported by the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub revision: u32,
    pub image: String,
    pub health: String,
}

/// Observed state of the target service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub cluster: String,
    pub service: String,
    /// `family:revision` of the task definition in service
    pub task_definition: String,
    pub image: String,
    pub desired_count: u32,
    pub healthy_count: usize,
    pub endpoint: Option<String>,
    pub tasks: Vec<TaskSummary>,
}
