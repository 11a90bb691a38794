//! In-memory collaborators
//!
//! Stand-ins for the source repository, build backend, image registry and
//! cluster. They keep enough state to observe what the pipeline did
//! (builds in order, environment seen, tasks started and stopped) and can
//! be told to fail in specific ways.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use shipway_core::domain::grant::{Permission, Principal, Resource};
use shipway_core::domain::image::ImageRef;
use shipway_core::domain::run::CommitRef;
use shipway_core::domain::service::{TargetService, TaskDefinition};
use shipway_core::error::{BuildError, DeployError, GrantError, SourceError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::collaborator::cluster::{
    ServiceCluster, ServiceState, TaskHealth, TaskId, TaskState, pull_failure,
};
use crate::collaborator::registry::{GrantTarget, ImageRegistry, RegistryError, RegistryPolicy};
use crate::collaborator::source::{CommitWatcher, SourceRepository};
use crate::service::build::{BuildBackend, BuildCache, BuildRequest, CacheNamespace};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Source
// =============================================================================

/// Repository whose commits are added by hand
#[derive(Default)]
pub struct InMemorySource {
    commits: Mutex<HashMap<String, Bytes>>,
    denied: AtomicBool,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_commit(&self, commit_id: impl Into<String>, content: impl Into<Bytes>) {
        lock(&self.commits).insert(commit_id.into(), content.into());
    }

    /// Makes every fetch fail with `AccessDenied`
    pub fn deny_access(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceRepository for InMemorySource {
    async fn fetch(&self, commit: &CommitRef) -> Result<Bytes, SourceError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(SourceError::AccessDenied(commit.to_string()));
        }
        lock(&self.commits)
            .get(&commit.commit_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(commit.to_string()))
    }
}

/// Watcher that reports queued batches of commits, one batch per poll
#[derive(Clone, Default)]
pub struct InMemoryWatcher {
    batches: Arc<Mutex<VecDeque<Vec<CommitRef>>>>,
}

impl InMemoryWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, commits: Vec<CommitRef>) {
        lock(&self.batches).push_back(commits);
    }
}

#[async_trait]
impl CommitWatcher for InMemoryWatcher {
    async fn poll(&mut self) -> Result<Vec<CommitRef>> {
        Ok(lock(&self.batches).pop_front().unwrap_or_default())
    }
}

// =============================================================================
// Build
// =============================================================================

/// What the in-memory builder saw for one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub commit_id: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Whether the source tree came from the cache
    pub cached_source: bool,
}

/// Decrements the in-flight counter even when a build is abandoned
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct InMemoryBuilder {
    delay: Duration,
    slow: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    records: Mutex<Vec<BuildRecord>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every build take at least `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes builds of one commit take `delay` instead
    pub fn slow_commit(&self, commit_id: impl Into<String>, delay: Duration) {
        lock(&self.slow).insert(commit_id.into(), delay);
    }

    /// Makes builds of a commit fail with `CompileFailure`
    pub fn fail_commit(&self, commit_id: impl Into<String>) {
        lock(&self.failing).insert(commit_id.into());
    }

    /// Completed builds in completion order
    pub fn builds(&self) -> Vec<BuildRecord> {
        lock(&self.records).clone()
    }

    /// Most builds ever observed running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildBackend for InMemoryBuilder {
    async fn build(
        &self,
        request: &BuildRequest<'_>,
        cache: &mut BuildCache,
    ) -> Result<(), BuildError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let fingerprint = &request.source.fingerprint;
        let cached_source = cache.lookup(CacheNamespace::Source, fingerprint).is_some();
        if !cached_source {
            let location = cache.entry_path(CacheNamespace::Source, fingerprint);
            cache.record(CacheNamespace::Source, fingerprint, location);
        }

        let delay = lock(&self.slow)
            .get(&request.commit.commit_id)
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.failing).contains(&request.commit.commit_id) {
            return Err(BuildError::CompileFailure(format!(
                "build of {} exited with code 2",
                request.commit.commit_id
            )));
        }

        lock(&self.records).push(BuildRecord {
            commit_id: request.commit.commit_id.clone(),
            image: request.image.to_string(),
            env: request.env.as_map().clone(),
            cached_source,
        });
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

pub struct InMemoryRegistry {
    repository: String,
    policy: RegistryPolicy,
    images: Mutex<BTreeSet<String>>,
    refused: Mutex<HashSet<Principal>>,
    grant_calls: AtomicUsize,
    fail_pushes: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            policy: RegistryPolicy::new(),
            images: Mutex::new(BTreeSet::new()),
            refused: Mutex::new(HashSet::new()),
            grant_calls: AtomicUsize::new(0),
            fail_pushes: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    /// Makes an image available without a push
    pub fn publish(&self, image: &ImageRef) {
        lock(&self.images).insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        lock(&self.images).contains(image)
    }

    pub fn images(&self) -> Vec<String> {
        lock(&self.images).iter().cloned().collect()
    }

    /// Makes the registry refuse grants for a principal
    pub fn refuse_grants_to(&self, principal: &Principal) {
        lock(&self.refused).insert(principal.clone());
    }

    /// Number of grants applied to this registry
    pub fn grant_calls(&self) -> usize {
        self.grant_calls.load(Ordering::SeqCst)
    }

    pub fn fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageRegistry for InMemoryRegistry {
    async fn push(&self, principal: &Principal, image: &ImageRef) -> Result<(), RegistryError> {
        self.policy.check(principal, Permission::Push, image)?;
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(RegistryError::Failed(format!(
                "upload of {} interrupted",
                image
            )));
        }
        self.publish(image);
        Ok(())
    }

    async fn pull(&self, principal: &Principal, image: &ImageRef) -> Result<(), RegistryError> {
        self.policy.check(principal, Permission::Pull, image)?;
        if self.has_image(&image.to_string()) {
            Ok(())
        } else {
            Err(RegistryError::NotFound(image.to_string()))
        }
    }
}

#[async_trait]
impl GrantTarget for InMemoryRegistry {
    fn resource(&self) -> Resource {
        Resource::Registry(self.repository.clone())
    }

    async fn apply_grant(
        &self,
        principal: &Principal,
        permissions: &BTreeSet<Permission>,
    ) -> Result<(), GrantError> {
        self.grant_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.refused).contains(principal) {
            return Err(GrantError::Unauthorized {
                principal: principal.clone(),
                resource: self.resource(),
                reason: "registry policy refuses this principal".to_string(),
            });
        }
        self.policy.allow(principal, permissions);
        Ok(())
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// How tasks running a given image respond to health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBehaviour {
    Healthy,
    /// Stays pending forever
    NeverHealthy,
    /// Crashes right after starting
    Unhealthy,
}

struct SimulatedTask {
    revision: u32,
    image: String,
    health: TaskHealth,
    behaviour: HealthBehaviour,
}

#[derive(Default)]
struct SimulatedState {
    revisions: HashMap<String, u32>,
    registrations: usize,
    services: HashMap<String, ServiceState>,
    tasks: HashMap<TaskId, SimulatedTask>,
    next_task: u64,
    stopped: Vec<TaskId>,
}

impl SimulatedState {
    fn spawn(&mut self, revision: u32, image: &str, behaviour: HealthBehaviour) -> TaskId {
        self.next_task += 1;
        let id = TaskId(format!("task-{}", self.next_task));
        let health = match behaviour {
            HealthBehaviour::Healthy => TaskHealth::Pending,
            HealthBehaviour::NeverHealthy => TaskHealth::Pending,
            HealthBehaviour::Unhealthy => TaskHealth::Unhealthy,
        };
        self.tasks.insert(
            id.clone(),
            SimulatedTask {
                revision,
                image: image.to_string(),
                health,
                behaviour,
            },
        );
        id
    }
}

/// Cluster simulation with scripted task health
pub struct InMemoryCluster {
    registry: Arc<dyn ImageRegistry>,
    health: Mutex<HashMap<String, HealthBehaviour>>,
    state: Mutex<SimulatedState>,
}

impl InMemoryCluster {
    pub fn new(registry: Arc<dyn ImageRegistry>) -> Self {
        Self {
            registry,
            health: Mutex::new(HashMap::new()),
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// Sets how tasks of an image behave; images default to healthy
    pub fn set_health(&self, image: impl Into<String>, behaviour: HealthBehaviour) {
        lock(&self.health).insert(image.into(), behaviour);
    }

    /// Creates the service with `desired_count` healthy tasks of its
    /// current task definition
    pub fn seed_service(&self, service: &TargetService) {
        let mut state = lock(&self.state);
        let definition = &service.task_definition;
        state
            .revisions
            .insert(definition.family.clone(), definition.revision);

        let mut tasks = Vec::new();
        for _ in 0..service.desired_count {
            let id = state.spawn(
                definition.revision,
                &definition.container.image,
                HealthBehaviour::Healthy,
            );
            if let Some(task) = state.tasks.get_mut(&id) {
                task.health = TaskHealth::Healthy;
            }
            tasks.push(TaskState {
                id,
                revision: definition.revision,
                image: definition.container.image.clone(),
                health: TaskHealth::Healthy,
            });
        }

        state.services.insert(
            service_key(service),
            ServiceState {
                task_definition: definition.clone(),
                desired_count: service.desired_count,
                tasks,
            },
        );
    }

    /// Tasks currently running, in or out of a service
    pub fn running_tasks(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    pub fn stopped_tasks(&self) -> Vec<TaskId> {
        lock(&self.state).stopped.clone()
    }

    /// Number of task definitions registered so far
    pub fn registrations(&self) -> usize {
        lock(&self.state).registrations
    }
}

fn service_key(service: &TargetService) -> String {
    format!("{}/{}", service.cluster, service.name)
}

#[async_trait]
impl ServiceCluster for InMemoryCluster {
    async fn describe_service(&self, service: &TargetService) -> Result<ServiceState, DeployError> {
        let state = lock(&self.state);
        Ok(state
            .services
            .get(&service_key(service))
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
        let mut state = lock(&self.state);
        state.registrations += 1;
        let latest = state
            .revisions
            .entry(definition.family.clone())
            .or_insert(definition.revision);
        *latest = (*latest).max(definition.revision) + 1;

        let mut registered = definition.clone();
        registered.revision = *latest;
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

        let behaviour = lock(&self.health)
            .get(&definition.container.image)
            .copied()
            .unwrap_or(HealthBehaviour::Healthy);

        Ok(lock(&self.state).spawn(definition.revision, &definition.container.image, behaviour))
    }

    async fn task_health(&self, task: &TaskId) -> Result<TaskHealth, DeployError> {
        let mut state = lock(&self.state);
        let task = state
            .tasks
            .get_mut(task)
            .ok_or_else(|| DeployError::RolloutFailed(format!("unknown task {}", task)))?;

        if task.behaviour == HealthBehaviour::Healthy {
            task.health = TaskHealth::Healthy;
        }
        Ok(task.health)
    }

    async fn stop_task(&self, task: &TaskId) -> Result<(), DeployError> {
        let mut state = lock(&self.state);
        if state.tasks.remove(task).is_some() {
            state.stopped.push(task.clone());
        }
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
        let mut state = lock(&self.state);

        let mut members = Vec::with_capacity(tasks.len());
        for id in tasks {
            let task = state
                .tasks
                .get(id)
                .ok_or_else(|| DeployError::RolloutFailed(format!("unknown task {}", id)))?;
            members.push(TaskState {
                id: id.clone(),
                revision: task.revision,
                image: task.image.clone(),
                health: task.health,
            });
        }

        state.services.insert(
            service_key(service),
            ServiceState {
                task_definition: definition.clone(),
                desired_count: service.desired_count,
                tasks: members,
            },
        );
        Ok(())
    }
}
