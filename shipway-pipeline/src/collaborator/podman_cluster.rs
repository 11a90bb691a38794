//! Local podman-backed service cluster
//!
//! Runs each task as a detached container publishing the service port on
//! the loopback interface. A task is healthy once an HTTP GET against its
//! health path answers with a success status.

use anyhow::{Context, Result};
use async_trait::async_trait;
use shipway_core::domain::image::ImageRef;
use shipway_core::domain::service::{TargetService, TaskDefinition};
use shipway_core::error::DeployError;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborator::cluster::{
    ServiceCluster, ServiceState, TaskHealth, TaskId, TaskState, pull_failure,
};
use crate::collaborator::registry::ImageRegistry;
use crate::podman::{self, ContainerSpec};

const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct TaskRecord {
    revision: u32,
    image: String,
    port: u16,
    health: TaskHealth,
}

#[derive(Default)]
struct ClusterState {
    revisions: HashMap<String, u32>,
    services: HashMap<String, ServiceState>,
    tasks: HashMap<TaskId, TaskRecord>,
}

/// Cluster that runs service tasks as local podman containers
pub struct PodmanCluster {
    registry: Arc<dyn ImageRegistry>,
    health_path: String,
    http: reqwest::Client,
    state: Mutex<ClusterState>,
}

impl PodmanCluster {
    /// Creates a cluster
    ///
    /// # Arguments
    /// * `registry` - Registry tasks pull their images from
    /// * `health_path` - HTTP path probed on each task's published port
    pub fn new(registry: Arc<dyn ImageRegistry>, health_path: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build health check client")?;

        Ok(Self {
            registry,
            health_path: health_path.into(),
            http,
            state: Mutex::new(ClusterState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn service_key(service: &TargetService) -> String {
        format!("{}/{}", service.cluster, service.name)
    }

    async fn probe(&self, task: &TaskId, port: u16) -> TaskHealth {
        match podman::is_running(&task.0).await {
            Ok(true) => {}
            Ok(false) => return TaskHealth::Unhealthy,
            Err(e) => {
                warn!("Failed to inspect task {}: {:#}", task, e);
                return TaskHealth::Pending;
            }
        }

        let host_port = match podman::host_port(&task.0, port).await {
            Ok(p) => p,
            Err(e) => {
                debug!("Task {} has no published port yet: {:#}", task, e);
                return TaskHealth::Pending;
            }
        };

        let url = format!("http://127.0.0.1:{}{}", host_port, self.health_path);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => TaskHealth::Healthy,
            Ok(response) => {
                debug!("Task {} answered {} on {}", task, response.status(), url);
                TaskHealth::Pending
            }
            Err(e) => {
                debug!("Task {} not answering on {}: {}", task, url, e);
                TaskHealth::Pending
            }
        }
    }
}

#[async_trait]
impl ServiceCluster for PodmanCluster {
    async fn describe_service(&self, service: &TargetService) -> Result<ServiceState, DeployError> {
        let state = self.state();
        Ok(state
            .services
            .get(&Self::service_key(service))
            .cloned()
            .unwrap_or_else(|| ServiceState {
                task_definition: service.task_definition.clone(),
                desired_count: service.desired_count,
                tasks: Vec::new(),
            }))
    }

    async fn register_task_definition(
        &self,
        definition: &TaskDefinition,
    ) -> Result<TaskDefinition, DeployError> {
        let mut state = self.state();
        let latest = state
            .revisions
            .entry(definition.family.clone())
            .or_insert(definition.revision);
        *latest = (*latest).max(definition.revision) + 1;

        let mut registered = definition.clone();
        registered.revision = *latest;
        info!("Registered task definition {}", registered.reference());
        Ok(registered)
    }

    async fn start_task(
        &self,
        service: &TargetService,
        definition: &TaskDefinition,
    ) -> Result<TaskId, DeployError> {
        let image = ImageRef::parse(&definition.container.image)
            .map_err(|e| DeployError::RolloutFailed(e.to_string()))?;

        self.registry
            .pull(&service.execution_identity, &image)
            .await
            .map_err(pull_failure)?;

        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}-{}",
            service.name,
            definition.revision,
            &suffix[..8]
        );

        let spec = ContainerSpec {
            name: name.clone(),
            image: definition.container.image.clone(),
            container_port: definition.container.port,
            environment: definition.container.environment.clone(),
            labels: BTreeMap::from([
                ("shipway.service".to_string(), service.name.clone()),
                ("shipway.revision".to_string(), definition.revision.to_string()),
            ]),
        };

        podman::run_detached(&spec)
            .await
            .map_err(|e| DeployError::RolloutFailed(format!("{:#}", e)))?;

        let id = TaskId(name);
        self.state().tasks.insert(
            id.clone(),
            TaskRecord {
                revision: definition.revision,
                image: definition.container.image.clone(),
                port: definition.container.port,
                health: TaskHealth::Pending,
            },
        );

        Ok(id)
    }

    async fn task_health(&self, task: &TaskId) -> Result<TaskHealth, DeployError> {
        let port = self
            .state()
            .tasks
            .get(task)
            .map(|record| record.port)
            .ok_or_else(|| DeployError::RolloutFailed(format!("unknown task {}", task)))?;

        let health = self.probe(task, port).await;

        if let Some(record) = self.state().tasks.get_mut(task) {
            record.health = health;
        }
        Ok(health)
    }

    async fn stop_task(&self, task: &TaskId) -> Result<(), DeployError> {
        podman::remove(&task.0)
            .await
            .map_err(|e| DeployError::RolloutFailed(format!("{:#}", e)))?;

        let mut state = self.state();
        state.tasks.remove(task);
        for service in state.services.values_mut() {
            service.tasks.retain(|t| &t.id != task);
        }
        Ok(())
    }

    async fn update_service(
        &self,
        service: &TargetService,
        definition: &TaskDefinition,
        tasks: &[TaskId],
    ) -> Result<(), DeployError> {
        let mut state = self.state();

        let mut members = Vec::with_capacity(tasks.len());
        for id in tasks {
            let record = state
                .tasks
                .get(id)
                .ok_or_else(|| DeployError::RolloutFailed(format!("unknown task {}", id)))?;
            members.push(TaskState {
                id: id.clone(),
                revision: record.revision,
                image: record.image.clone(),
                health: record.health,
            });
        }

        state.services.insert(
            Self::service_key(service),
            ServiceState {
                task_definition: definition.clone(),
                desired_count: service.desired_count,
                tasks: members,
            },
        );

        info!(
            "Service {} now runs {}",
            service.name,
            definition.reference()
        );
        Ok(())
    }
}
