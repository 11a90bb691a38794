//! Deploy executor
//!
//! Rolls a built image out to the target service with replace-then-drain:
//! the new tasks must all be healthy before the service switches to them
//! and the old tasks are stopped. If anything fails before the switch the
//! new tasks are stopped and the service keeps its previous revision.
//!
//! The switch is the point of no return. Timeout and cancellation only
//! apply before it; the drain afterwards runs in its own task and always
//! completes.

use serde::Serialize;
use shipway_core::domain::artifact::Artifact;
use shipway_core::domain::image::ImageDefinition;
use shipway_core::domain::service::{TargetService, TaskDefinition};
use shipway_core::error::{DeployError, StageError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborator::cluster::{ServiceCluster, ServiceState, TaskHealth, TaskId};

/// Outcome of a completed rollout
#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub service: String,
    pub image: String,
    pub previous_revision: u32,
    pub revision: u32,
    pub started_tasks: Vec<TaskId>,
    pub drained_tasks: Vec<TaskId>,
}

/// Replacement tasks of a rollout in progress
///
/// Tasks still tracked when the guard is dropped are stopped in the
/// background, which covers rollouts abandoned by cancellation or timeout.
struct RolloutGuard {
    cluster: Arc<dyn ServiceCluster>,
    tasks: Vec<TaskId>,
}

impl RolloutGuard {
    fn new(cluster: Arc<dyn ServiceCluster>) -> Self {
        Self {
            cluster,
            tasks: Vec::new(),
        }
    }

    /// Hands the tasks over to the service
    fn commit(mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.tasks)
    }

    /// Stops the replacement tasks now
    ///
    /// A task leaves the guard only once it is stopped, so an abort that is
    /// itself abandoned still leaves the rest to `Drop`.
    async fn abort(mut self) {
        while let Some(task) = self.tasks.last().cloned() {
            if let Err(e) = self.cluster.stop_task(&task).await {
                warn!("Failed to stop replacement task {}: {}", task, e);
            }
            self.tasks.pop();
        }
    }
}

impl Drop for RolloutGuard {
    fn drop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }

        let tasks = std::mem::take(&mut self.tasks);
        let cluster = Arc::clone(&self.cluster);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for task in tasks {
                        if let Err(e) = cluster.stop_task(&task).await {
                            warn!("Failed to stop abandoned task {}: {}", task, e);
                        }
                    }
                });
            }
            Err(_) => warn!("No runtime to stop {} abandoned task(s)", tasks.len()),
        }
    }
}

/// A service that now runs the new revision
struct Switched {
    previous: ServiceState,
    next: TaskDefinition,
    started: Vec<TaskId>,
}

pub struct DeployExecutor {
    cluster: Arc<dyn ServiceCluster>,
    timeout: Duration,
    poll_interval: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeployExecutor {
    /// Creates a deploy executor
    ///
    /// # Arguments
    /// * `cluster` - Cluster hosting the target services
    /// * `timeout` - Limit for starting new tasks, health checks and the switch
    /// * `poll_interval` - Pause between health checks of new tasks
    pub fn new(cluster: Arc<dyn ServiceCluster>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            cluster,
            timeout,
            poll_interval,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ServiceCluster> {
        &self.cluster
    }

    fn service_lock(&self, service: &TargetService) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{}/{}", service.cluster, service.name);
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key).or_default())
    }

    /// Deploys the image named by a build artifact
    ///
    /// Only one rollout per service runs at a time; others wait here. The
    /// service lock is held until the old tasks are drained.
    ///
    /// # Errors
    /// `Cancelled` if the token fires before the switch, otherwise the
    /// [`DeployError`] that stopped the rollout. The service keeps its
    /// previous revision in every error case.
    pub async fn deploy(
        &self,
        artifact: &Artifact,
        service: &TargetService,
        cancel: &CancellationToken,
    ) -> Result<DeployResult, StageError> {
        let image = image_for(artifact, service)?;

        let lock = self.service_lock(service);
        let rollout = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            rollout = lock.lock_owned() => rollout,
        };

        info!(
            "Deploying {} to service {} (grace {:?})",
            image,
            service.name,
            service.health_check_grace_period()
        );

        let switched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Rollout of {} to {} cancelled before the switch", image, service.name);
                return Err(StageError::Cancelled);
            }
            switched = tokio::time::timeout(self.timeout, self.switch(&image, service)) => match switched {
                Ok(switched) => switched?,
                Err(_) => {
                    warn!("Rollout of {} exceeded {:?}", image, self.timeout);
                    return Err(DeployError::RolloutFailed(format!(
                        "rollout exceeded timeout of {:?}",
                        self.timeout
                    ))
                    .into());
                }
            },
        };

        // Past the switch: the drain owns the old tasks and the service lock
        let old: Vec<TaskId> = switched.previous.tasks.iter().map(|t| t.id.clone()).collect();
        let draining = tokio::spawn(drain(Arc::clone(&self.cluster), old, rollout));
        let drained = match draining.await {
            Ok(drained) => drained,
            Err(e) => {
                warn!("Drain of {} failed: {}", service.name, e);
                Vec::new()
            }
        };

        info!(
            "Service {} switched from {} to {} ({} task(s) drained)",
            service.name,
            switched.previous.task_definition.reference(),
            switched.next.reference(),
            drained.len()
        );

        Ok(DeployResult {
            service: service.name.clone(),
            image,
            previous_revision: switched.previous.task_definition.revision,
            revision: switched.next.revision,
            started_tasks: switched.started,
            drained_tasks: drained,
        })
    }

    /// Registers the new revision and switches the service over to it
    async fn switch(&self, image: &str, service: &TargetService) -> Result<Switched, DeployError> {
        let previous = self.cluster.describe_service(service).await?;
        let next = self
            .cluster
            .register_task_definition(&previous.task_definition.with_image(image))
            .await?;

        let mut guard = RolloutGuard::new(Arc::clone(&self.cluster));
        if let Err(e) = self.replace(service, &next, &mut guard).await {
            warn!(
                "Rollout of {} to {} failed, keeping {}: {}",
                next.reference(),
                service.name,
                previous.task_definition.reference(),
                e
            );
            guard.abort().await;
            return Err(e);
        }

        Ok(Switched {
            previous,
            next,
            started: guard.commit(),
        })
    }

    /// Starts the replacement tasks, waits for health and switches the service
    async fn replace(
        &self,
        service: &TargetService,
        next: &TaskDefinition,
        guard: &mut RolloutGuard,
    ) -> Result<(), DeployError> {
        for _ in 0..service.desired_count {
            let task = self.cluster.start_task(service, next).await?;
            debug!("Started replacement task {}", task);
            guard.tasks.push(task);
        }

        self.await_healthy(&guard.tasks, service.health_check_grace_period())
            .await?;

        self.cluster
            .update_service(service, next, &guard.tasks)
            .await
    }

    /// Waits until every task is healthy or the grace period ends
    async fn await_healthy(&self, tasks: &[TaskId], grace: Duration) -> Result<(), DeployError> {
        let deadline = Instant::now() + grace;
        let mut pending: Vec<&TaskId> = tasks.iter().collect();

        loop {
            let mut still_pending = Vec::new();
            for task in pending {
                match self.cluster.task_health(task).await? {
                    TaskHealth::Healthy => debug!("Task {} is healthy", task),
                    TaskHealth::Pending => still_pending.push(task),
                    TaskHealth::Unhealthy => {
                        return Err(DeployError::RolloutFailed(format!(
                            "task {} stopped before becoming healthy",
                            task
                        )));
                    }
                }
            }

            let Some(first) = still_pending.first() else {
                return Ok(());
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(DeployError::HealthCheckTimeout {
                    task: first.to_string(),
                    grace,
                });
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            pending = still_pending;
        }
    }
}

/// Stops the tasks a switched service no longer uses
async fn drain(
    cluster: Arc<dyn ServiceCluster>,
    tasks: Vec<TaskId>,
    _rollout: OwnedMutexGuard<()>,
) -> Vec<TaskId> {
    let mut drained = Vec::with_capacity(tasks.len());
    for task in tasks {
        match cluster.stop_task(&task).await {
            Ok(()) => drained.push(task),
            Err(e) => warn!("Failed to drain task {}: {}", task, e),
        }
    }
    drained
}

/// Image the build artifact names for the service's container
fn image_for(artifact: &Artifact, service: &TargetService) -> Result<String, DeployError> {
    let definitions: Vec<ImageDefinition> = serde_json::from_slice(&artifact.content)
        .map_err(|e| {
            DeployError::RolloutFailed(format!("invalid image definitions {}: {}", artifact.name, e))
        })?;

    definitions
        .into_iter()
        .find(|d| d.name == service.container_name())
        .map(|d| d.image_uri)
        .ok_or_else(|| {
            DeployError::RolloutFailed(format!(
                "{} has no image for container {}",
                artifact.name,
                service.container_name()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HealthBehaviour, InMemoryCluster, InMemoryRegistry};
    use async_trait::async_trait;
    use bytes::Bytes;
    use shipway_core::domain::grant::{Permission, Principal};
    use shipway_core::domain::image::ImageRef;
    use shipway_core::domain::service::ContainerDefinition;
    use shipway_core::domain::stage::StageKind;
    use std::collections::{BTreeMap, BTreeSet};
    use uuid::Uuid;

    const NEW_IMAGE: &str = "localhost:5000/app:abc123";
    const NEXT_IMAGE: &str = "localhost:5000/app:def456";

    fn service(grace_seconds: u64) -> TargetService {
        TargetService {
            cluster: "local".to_string(),
            name: "web".to_string(),
            task_definition: TaskDefinition {
                family: "web".to_string(),
                revision: 1,
                container: ContainerDefinition {
                    name: "web".to_string(),
                    image: "localhost:5000/app:initial".to_string(),
                    port: 8080,
                    environment: BTreeMap::new(),
                },
            },
            desired_count: 2,
            execution_identity: Principal::new("web-execution"),
            health_check_grace_seconds: grace_seconds,
            endpoint: None,
        }
    }

    fn build_artifact(image: &str) -> Artifact {
        let content = serde_json::to_vec(&vec![ImageDefinition {
            name: "web".to_string(),
            image_uri: image.to_string(),
        }])
        .unwrap();
        Artifact::new(Uuid::new_v4(), "build:abc123", StageKind::Build, Bytes::from(content))
    }

    async fn fixture(grace_seconds: u64) -> (DeployExecutor, Arc<InMemoryCluster>, TargetService) {
        let registry = Arc::new(InMemoryRegistry::new("app"));
        let service = service(grace_seconds);
        registry.policy().allow(&service.execution_identity, &BTreeSet::from([Permission::Pull]));
        for image in [NEW_IMAGE, NEXT_IMAGE] {
            registry.publish(&ImageRef::parse(image).unwrap());
        }

        let cluster = Arc::new(InMemoryCluster::new(registry));
        cluster.seed_service(&service);

        let executor = DeployExecutor::new(
            cluster.clone(),
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        (executor, cluster, service)
    }

    /// In-memory cluster with slow health checks and task stops that
    /// records the order of starts and switches
    struct PacedCluster {
        inner: Arc<InMemoryCluster>,
        health_delay: Duration,
        stop_delay: Duration,
        steps: Mutex<Vec<String>>,
    }

    impl PacedCluster {
        fn new(inner: Arc<InMemoryCluster>, health_delay: Duration, stop_delay: Duration) -> Self {
            Self {
                inner,
                health_delay,
                stop_delay,
                steps: Mutex::new(Vec::new()),
            }
        }

        fn steps(&self) -> Vec<String> {
            self.steps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceCluster for PacedCluster {
        async fn describe_service(&self, service: &TargetService) -> Result<ServiceState, DeployError> {
            self.inner.describe_service(service).await
        }

        async fn register_task_definition(
            &self,
            definition: &TaskDefinition,
        ) -> Result<TaskDefinition, DeployError> {
            self.inner.register_task_definition(definition).await
        }

        async fn start_task(
            &self,
            service: &TargetService,
            definition: &TaskDefinition,
        ) -> Result<TaskId, DeployError> {
            self.steps
                .lock()
                .unwrap()
                .push(format!("start {}", definition.container.image));
            self.inner.start_task(service, definition).await
        }

        async fn task_health(&self, task: &TaskId) -> Result<TaskHealth, DeployError> {
            tokio::time::sleep(self.health_delay).await;
            self.inner.task_health(task).await
        }

        async fn stop_task(&self, task: &TaskId) -> Result<(), DeployError> {
            tokio::time::sleep(self.stop_delay).await;
            self.inner.stop_task(task).await
        }

        async fn update_service(
            &self,
            service: &TargetService,
            definition: &TaskDefinition,
            tasks: &[TaskId],
        ) -> Result<(), DeployError> {
            self.steps
                .lock()
                .unwrap()
                .push(format!("switch {}", definition.container.image));
            self.inner.update_service(service, definition, tasks).await
        }
    }

    async fn wait_for_running(cluster: &InMemoryCluster, expected: usize) {
        for _ in 0..200 {
            if cluster.running_tasks() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} running tasks, found {}",
            expected,
            cluster.running_tasks()
        );
    }

    #[tokio::test]
    async fn test_replace_then_drain() {
        let (executor, cluster, service) = fixture(5).await;
        let before = cluster.describe_service(&service).await.unwrap();

        let result = executor
            .deploy(&build_artifact(NEW_IMAGE), &service, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.previous_revision, 1);
        assert_eq!(result.revision, 2);
        assert_eq!(result.started_tasks.len(), 2);
        assert_eq!(result.drained_tasks.len(), 2);

        let after = cluster.describe_service(&service).await.unwrap();
        assert_eq!(after.task_definition.container.image, NEW_IMAGE);
        assert_eq!(after.healthy_count(), 2);
        assert!(after.tasks.iter().all(|t| !before.tasks.contains(t)));
    }

    #[tokio::test]
    async fn test_health_check_timeout_keeps_previous_revision() {
        let (executor, cluster, service) = fixture(1).await;
        cluster.set_health(NEW_IMAGE, HealthBehaviour::NeverHealthy);
        let before = cluster.describe_service(&service).await.unwrap();

        let result = executor
            .deploy(&build_artifact(NEW_IMAGE), &service, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(StageError::Deploy(DeployError::HealthCheckTimeout { .. }))));
        let after = cluster.describe_service(&service).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(after.healthy_count(), 2);
        assert_eq!(cluster.running_tasks(), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_task_fails_rollout() {
        let (executor, cluster, service) = fixture(5).await;
        cluster.set_health(NEW_IMAGE, HealthBehaviour::Unhealthy);

        let result = executor
            .deploy(&build_artifact(NEW_IMAGE), &service, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(StageError::Deploy(DeployError::RolloutFailed(_)))));
        assert_eq!(cluster.running_tasks(), 2);
    }

    #[tokio::test]
    async fn test_pull_denied() {
        let (executor, _cluster, mut service) = fixture(5).await;
        service.execution_identity = Principal::new("nobody");

        let result = executor
            .deploy(&build_artifact(NEW_IMAGE), &service, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(StageError::Deploy(DeployError::ImagePullDenied(_)))));
    }

    #[tokio::test]
    async fn test_missing_container_image() {
        let (executor, _cluster, mut service) = fixture(5).await;
        service.task_definition.container.name = "api".to_string();

        let result = executor
            .deploy(&build_artifact(NEW_IMAGE), &service, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(StageError::Deploy(DeployError::RolloutFailed(_)))));
    }

    #[tokio::test]
    async fn test_slow_drain_is_not_cut_short_by_the_timeout() {
        let (_, inner, service) = fixture(5).await;
        let cluster = Arc::new(PacedCluster::new(
            inner.clone(),
            Duration::ZERO,
            Duration::from_millis(300),
        ));
        let executor = DeployExecutor::new(
            cluster,
            Duration::from_millis(200),
            Duration::from_millis(10),
        );

        let result = executor
            .deploy(&build_artifact(NEW_IMAGE), &service, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.revision, 2);
        assert_eq!(result.drained_tasks.len(), 2);
        assert_eq!(inner.running_tasks(), 2);
        let after = inner.describe_service(&service).await.unwrap();
        assert_eq!(after.task_definition.container.image, NEW_IMAGE);
    }

    #[tokio::test]
    async fn test_cancel_after_switch_completes_the_rollout() {
        let (_, inner, service) = fixture(5).await;
        let cluster = Arc::new(PacedCluster::new(
            inner.clone(),
            Duration::ZERO,
            Duration::from_millis(100),
        ));
        let executor = DeployExecutor::new(cluster, Duration::from_secs(30), Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let artifact = build_artifact(NEW_IMAGE);

        let cancel_once_switched = async {
            loop {
                let state = inner.describe_service(&service).await.unwrap();
                if state.task_definition.container.image == NEW_IMAGE {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(
            executor.deploy(&artifact, &service, &cancel),
            cancel_once_switched
        );

        let result = result.unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(result.drained_tasks.len(), 2);
        assert_eq!(inner.running_tasks(), 2);
    }

    #[tokio::test]
    async fn test_cancel_before_switch_stops_replacement_tasks() {
        let (executor, cluster, service) = fixture(30).await;
        cluster.set_health(NEW_IMAGE, HealthBehaviour::NeverHealthy);
        let before = cluster.describe_service(&service).await.unwrap();
        let cancel = CancellationToken::new();
        let artifact = build_artifact(NEW_IMAGE);

        let cancel_once_started = async {
            wait_for_running(&cluster, 4).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(
            executor.deploy(&artifact, &service, &cancel),
            cancel_once_started
        );

        assert!(matches!(result, Err(StageError::Cancelled)));
        wait_for_running(&cluster, 2).await;
        assert_eq!(cluster.describe_service(&service).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_concurrent_deploys_to_one_service_queue() {
        let (_, inner, service) = fixture(5).await;
        let cluster = Arc::new(PacedCluster::new(
            inner.clone(),
            Duration::from_millis(50),
            Duration::ZERO,
        ));
        let executor = DeployExecutor::new(
            cluster.clone(),
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        let cancel = CancellationToken::new();
        let first = build_artifact(NEW_IMAGE);
        let second = build_artifact(NEXT_IMAGE);

        let (a, b) = tokio::join!(
            executor.deploy(&first, &service, &cancel),
            executor.deploy(&second, &service, &cancel)
        );
        a.unwrap();
        b.unwrap();

        // Each rollout starts its tasks and switches before the next begins
        let steps = cluster.steps();
        assert_eq!(steps.len(), 6);
        for rollout in steps.chunks(3) {
            let image = rollout[0].trim_start_matches("start ");
            assert_eq!(rollout[1], format!("start {}", image));
            assert_eq!(rollout[2], format!("switch {}", image));
        }
        assert_ne!(steps[0], steps[3]);
        assert_eq!(inner.running_tasks(), 2);
    }
}
