//! End-to-end pipeline scenarios against the in-memory collaborators

use shipway_core::domain::environment;
use shipway_core::domain::grant::{Permission, Principal, Resource};
use shipway_core::domain::image::ImageDefinition;
use shipway_core::domain::run::{CommitRef, Run, RunOutcome, RunStatus, StageStatus, TriggerSource};
use shipway_core::domain::stage::StageKind;
use shipway_core::error::ErrorKind;
use shipway_pipeline::memory::{
    HealthBehaviour, InMemoryBuilder, InMemoryCluster, InMemoryRegistry, InMemorySource,
    InMemoryWatcher,
};
use shipway_pipeline::{Pipeline, Topology, TopologyConfig, bind_topology};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const IMAGE_ABC123: &str = "acct.dkr.ecr.us-west-2.amazonaws.com/veengu-back:abc123";

struct Harness {
    topology: Topology,
    source: Arc<InMemorySource>,
    builder: Arc<InMemoryBuilder>,
    registry: Arc<InMemoryRegistry>,
    cluster: Arc<InMemoryCluster>,
    config: TopologyConfig,
    _workspace: tempfile::TempDir,
}

impl Harness {
    async fn new(configure: impl FnOnce(&mut TopologyConfig)) -> Self {
        Self::with_builder(InMemoryBuilder::new(), configure).await
    }

    async fn with_builder(
        builder: InMemoryBuilder,
        configure: impl FnOnce(&mut TopologyConfig),
    ) -> Self {
        let workspace = tempfile::tempdir().unwrap();

        let mut config = TopologyConfig::new("https://git.example.com/veengu/backend.git", "acct");
        config.workspace_base = workspace.path().to_path_buf();
        config.health_poll_interval = Duration::from_millis(10);
        config.health_check_grace = Duration::from_secs(5);
        config.deploy_timeout = Duration::from_secs(30);
        config.desired_count = 2;
        configure(&mut config);

        let source = Arc::new(InMemorySource::new());
        let builder = Arc::new(builder);
        let registry = Arc::new(InMemoryRegistry::new(config.image_name.clone()));
        let cluster = Arc::new(InMemoryCluster::new(registry.clone()));
        cluster.seed_service(&config.target_service());

        let topology = Topology::assemble(
            &config,
            source.clone(),
            builder.clone(),
            registry.clone(),
            cluster.clone(),
        )
        .await
        .unwrap();

        Self {
            topology,
            source,
            builder,
            registry,
            cluster,
            config,
            _workspace: workspace,
        }
    }

    fn pipeline(&self) -> &Arc<Pipeline> {
        &self.topology.pipeline
    }

    fn commit(&self, id: &str) -> CommitRef {
        self.source.add_commit(id, format!("bundle of {}", id));
        CommitRef::new("main", id)
    }

    async fn run_to_end(&self, id: &str) -> Run {
        let run = self
            .pipeline()
            .create_run(self.commit(id), TriggerSource::Manual);
        self.pipeline().start(run.id).await.unwrap();
        self.pipeline().get_run(run.id).unwrap()
    }

    async fn wait_until(&self, run_id: Uuid, done: impl Fn(&Run) -> bool) -> Run {
        for _ in 0..500 {
            if let Some(run) = self.pipeline().get_run(run_id) {
                if done(&run) {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} did not reach the expected state", run_id);
    }
}

fn failed_with(run: &Run, stage: StageKind, kind: ErrorKind) -> bool {
    matches!(
        &run.outcome,
        Some(RunOutcome::Failed { stage: s, kind: k, .. }) if *s == stage && *k == kind
    )
}

#[tokio::test]
async fn test_commit_flows_to_service() {
    let h = Harness::new(|_| {}).await;

    let run = h.run_to_end("abc123").await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert!(run.stages.iter().all(|s| s.status == StageStatus::Succeeded));
    assert_eq!(
        run.stage(StageKind::Source).unwrap().artifact.as_deref(),
        Some("src:abc123")
    );
    assert_eq!(
        run.stage(StageKind::Build).unwrap().artifact.as_deref(),
        Some("build:abc123")
    );

    let store = h.pipeline().artifacts();
    let source = store.get(run.id, "src:abc123").unwrap();
    assert_eq!(&source.content[..], b"bundle of abc123");

    let build = store.get(run.id, "build:abc123").unwrap();
    let definitions: Vec<ImageDefinition> = serde_json::from_slice(&build.content).unwrap();
    assert_eq!(
        definitions,
        vec![ImageDefinition {
            name: "web".to_string(),
            image_uri: IMAGE_ABC123.to_string(),
        }]
    );
    assert!(h.registry.has_image(IMAGE_ABC123));

    let service = h.pipeline().service_state().await.unwrap();
    assert_eq!(service.task_definition.container.image, IMAGE_ABC123);
    assert_eq!(service.task_definition.revision, 2);
    assert_eq!(service.healthy_count(), 2);
    assert_eq!(h.cluster.stopped_tasks().len(), 2);
}

#[tokio::test]
async fn test_build_sees_exactly_the_configured_environment() {
    let h = Harness::new(|_| {}).await;

    h.run_to_end("abc123").await;

    let builds = h.builder.builds();
    assert_eq!(builds.len(), 1);

    let keys: Vec<&str> = builds[0].env.keys().map(String::as_str).collect();
    let env = h.config.environment().unwrap();
    let expected: Vec<&str> = env.keys().collect();
    assert_eq!(keys, expected);
    assert_eq!(builds[0].env.get(environment::REGION).map(String::as_str), Some("us-west-2"));
    assert_eq!(builds[0].env.get(environment::CONTAINER_PORT).map(String::as_str), Some("8080"));
    assert_eq!(builds[0].image, IMAGE_ABC123);
}

#[tokio::test]
async fn test_build_timeout_never_reaches_deploy() {
    let builder = InMemoryBuilder::new().with_delay(Duration::from_millis(500));
    let h = Harness::with_builder(builder, |config| {
        config.build_timeout = Duration::from_millis(50);
    })
    .await;
    let before = h.pipeline().service_state().await.unwrap();

    let run = h.run_to_end("abc123").await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(failed_with(&run, StageKind::Build, ErrorKind::Timeout));
    assert_eq!(run.outcome.as_ref().unwrap().to_string(), "Failed(Build, Timeout)");
    assert_eq!(run.stage(StageKind::Deploy).unwrap().status, StageStatus::Skipped);
    assert!(!h.pipeline().artifacts().contains(run.id, "build:abc123"));
    assert!(!h.registry.has_image(IMAGE_ABC123));

    assert_eq!(h.cluster.registrations(), 0);
    assert_eq!(h.pipeline().service_state().await.unwrap(), before);
}

#[tokio::test]
async fn test_compile_failure() {
    let h = Harness::new(|_| {}).await;
    h.builder.fail_commit("abc123");

    let run = h.run_to_end("abc123").await;

    assert!(failed_with(&run, StageKind::Build, ErrorKind::CompileFailure));
    assert_eq!(h.cluster.registrations(), 0);
}

#[tokio::test]
async fn test_push_failure_publishes_nothing() {
    let h = Harness::new(|_| {}).await;
    h.registry.fail_pushes(true);

    let run = h.run_to_end("abc123").await;

    assert!(failed_with(&run, StageKind::Build, ErrorKind::ImagePushFailure));
    assert!(!h.pipeline().artifacts().contains(run.id, "build:abc123"));
    assert_eq!(h.cluster.registrations(), 0);
}

#[tokio::test]
async fn test_source_errors() {
    let h = Harness::new(|_| {}).await;

    let missing = h
        .pipeline()
        .create_run(CommitRef::new("main", "deadbeef"), TriggerSource::Manual);
    h.pipeline().start(missing.id).await.unwrap();
    let missing = h.pipeline().get_run(missing.id).unwrap();
    assert!(failed_with(&missing, StageKind::Source, ErrorKind::NotFound));

    h.source.deny_access(true);
    let denied = h.run_to_end("abc123").await;
    assert!(failed_with(&denied, StageKind::Source, ErrorKind::AccessDenied));
    assert!(h.builder.builds().is_empty());
}

#[tokio::test]
async fn test_health_check_timeout_leaves_service_unchanged() {
    let h = Harness::new(|config| {
        config.health_check_grace = Duration::from_secs(1);
    })
    .await;
    h.cluster.set_health(IMAGE_ABC123, HealthBehaviour::NeverHealthy);
    let before = h.pipeline().service_state().await.unwrap();

    let run = h.run_to_end("abc123").await;

    assert!(failed_with(&run, StageKind::Deploy, ErrorKind::HealthCheckTimeout));

    let after = h.pipeline().service_state().await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.desired_count, 2);
    assert_eq!(after.healthy_count(), 2);
    assert_eq!(h.cluster.running_tasks(), 2);
}

#[tokio::test]
async fn test_rapid_commits_build_in_commit_order() {
    let builder = InMemoryBuilder::new().with_delay(Duration::from_millis(30));
    let h = Harness::with_builder(builder, |_| {}).await;

    let first = h.commit("c1");
    let second = h.commit("c2");
    let runs = h
        .topology
        .listener
        .accept_all(vec![first, second], TriggerSource::Poller);
    assert_eq!(runs.len(), 2);
    assert!(runs[0].sequence < runs[1].sequence);

    for run in &runs {
        let done = h.wait_until(run.id, |r| r.status.is_terminal()).await;
        assert_eq!(done.status, RunStatus::Succeeded);
    }

    let order: Vec<String> = h.builder.builds().into_iter().map(|b| b.commit_id).collect();
    assert_eq!(order, vec!["c1", "c2"]);
    assert_eq!(h.builder.max_concurrent(), 1);

    let service = h.pipeline().service_state().await.unwrap();
    assert!(service.task_definition.container.image.ends_with(":c2"));
}

#[tokio::test]
async fn test_concurrent_runs_never_share_the_build_section() {
    let builder = InMemoryBuilder::new().with_delay(Duration::from_millis(20));
    let h = Harness::with_builder(builder, |_| {}).await;

    let mut handles = Vec::new();
    for id in ["a1", "a2", "a3", "a4"] {
        let (_, handle) = h.pipeline().submit(h.commit(id), TriggerSource::Webhook);
        handles.push(handle);
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(result.outcome.is_success());
    }

    assert_eq!(h.builder.builds().len(), 4);
    assert_eq!(h.builder.max_concurrent(), 1);
}

#[tokio::test]
async fn test_listener_ignores_other_branches() {
    let h = Harness::new(|_| {}).await;

    let run = h
        .topology
        .listener
        .accept(CommitRef::new("feature", "abc123"), TriggerSource::Webhook);

    assert!(run.is_none());
    assert!(h.pipeline().list_runs().is_empty());
}

#[tokio::test]
async fn test_poller_creates_one_run_per_commit() {
    let h = Harness::new(|_| {}).await;
    let watcher = InMemoryWatcher::new();
    watcher.push(vec![h.commit("p1"), h.commit("p2"), h.commit("p3")]);

    let shutdown = CancellationToken::new();
    let listener = Arc::clone(&h.topology.listener);
    let poller = {
        let shutdown = shutdown.clone();
        let watcher = watcher.clone();
        tokio::spawn(async move {
            listener
                .watch(watcher, Duration::from_millis(10), shutdown)
                .await
        })
    };

    for _ in 0..500 {
        if h.pipeline().list_runs().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    poller.await.unwrap().unwrap();

    let runs = h.pipeline().list_runs();
    let commits: Vec<&str> = runs.iter().map(|r| r.commit.commit_id.as_str()).collect();
    assert_eq!(commits, vec!["p1", "p2", "p3"]);
    assert!(runs.iter().all(|r| r.trigger == TriggerSource::Poller));

    for run in &runs {
        h.wait_until(run.id, |r| r.status.is_terminal()).await;
    }
}

#[tokio::test]
async fn test_channel_events_become_runs_until_sender_closes() {
    let h = Harness::new(|_| {}).await;
    let (events, receiver) = tokio::sync::mpsc::channel(8);

    events.send(h.commit("c1")).await.unwrap();
    events.send(CommitRef::new("feature", "f1")).await.unwrap();
    events.send(h.commit("c2")).await.unwrap();
    drop(events);

    h.topology
        .listener
        .listen(receiver, TriggerSource::Webhook, CancellationToken::new())
        .await;

    let runs = h.pipeline().list_runs();
    let commits: Vec<&str> = runs.iter().map(|r| r.commit.commit_id.as_str()).collect();
    assert_eq!(commits, vec!["c1", "c2"]);
    assert!(runs.iter().all(|r| r.trigger == TriggerSource::Webhook));

    for run in &runs {
        h.wait_until(run.id, |r| r.status.is_terminal()).await;
    }
}

#[tokio::test]
async fn test_cancel_running_and_queued_runs() {
    let h = Harness::new(|_| {}).await;
    h.builder.slow_commit("slow", Duration::from_secs(30));

    let (slow, slow_handle) = h.pipeline().submit(h.commit("slow"), TriggerSource::Manual);
    let queued = h
        .pipeline()
        .create_run(h.commit("queued"), TriggerSource::Manual);

    h.wait_until(slow.id, |r| r.current_stage == Some(1)).await;

    let cancelled = h.pipeline().cancel(queued.id).unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    h.pipeline().cancel(slow.id).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), slow_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(matches!(
        result.outcome,
        RunOutcome::Failed { stage: StageKind::Build, kind: ErrorKind::Cancelled, .. }
    ));
    let slow = h.pipeline().get_run(slow.id).unwrap();
    assert_eq!(slow.status, RunStatus::Cancelled);
    assert!(!h.pipeline().artifacts().contains(slow.id, "build:slow"));
    assert!(h.builder.builds().is_empty());

    // Later runs are not held up by either cancelled run
    let next = tokio::time::timeout(Duration::from_secs(5), h.run_to_end("next"))
        .await
        .unwrap();
    assert_eq!(next.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_cancel_during_rollout_keeps_previous_revision() {
    let h = Harness::new(|config| config.health_check_grace = Duration::from_secs(20)).await;
    h.cluster.set_health(IMAGE_ABC123, HealthBehaviour::NeverHealthy);
    let before = h.pipeline().service_state().await.unwrap();

    let (run, handle) = h.pipeline().submit(h.commit("abc123"), TriggerSource::Manual);
    h.wait_until(run.id, |r| r.current_stage == Some(2)).await;
    for _ in 0..500 {
        if h.cluster.running_tasks() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.pipeline().cancel(run.id).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(matches!(
        result.outcome,
        RunOutcome::Failed { stage: StageKind::Deploy, kind: ErrorKind::Cancelled, .. }
    ));
    for _ in 0..500 {
        if h.cluster.running_tasks() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.cluster.running_tasks(), 2);
    assert_eq!(h.pipeline().service_state().await.unwrap(), before);
}

#[tokio::test]
async fn test_events_follow_the_run() {
    let h = Harness::new(|_| {}).await;
    let mut events = h.pipeline().subscribe();

    let run = h.run_to_end("abc123").await;

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.run.id == run.id {
            statuses.push(event.run.status);
        }
    }
    assert_eq!(statuses.first(), Some(&RunStatus::Queued));
    assert_eq!(statuses.last(), Some(&RunStatus::Succeeded));
    assert!(statuses.contains(&RunStatus::Running));
}

#[tokio::test]
async fn test_binding_twice_changes_nothing() {
    let h = Harness::new(|_| {}).await;
    let resource = Resource::Registry("veengu-back".to_string());
    let builder = Principal::new(h.config.builder_principal.clone());
    let before = h.topology.binder.grants();
    let calls = h.registry.grant_calls();

    bind_topology(&h.topology.binder, &resource, &builder, &h.config.target_service())
        .await
        .unwrap();

    assert_eq!(h.topology.binder.grants(), before);
    assert_eq!(h.registry.grant_calls(), calls);

    let execution = h.topology.binder.effective(&Principal::new("shipway-execution"), &resource);
    assert!(execution.contains(&Permission::Pull));
    assert!(!execution.contains(&Permission::Push));
    assert_eq!(h.topology.binder.effective(&builder, &resource).len(), 2);
}

#[tokio::test]
async fn test_start_is_single_use() {
    let h = Harness::new(|_| {}).await;
    let run = h.pipeline().create_run(h.commit("abc123"), TriggerSource::Manual);

    h.pipeline().start(run.id).await.unwrap();
    let again = h.pipeline().start(run.id).await;

    assert!(again.is_err());
    assert!(h.pipeline().start(Uuid::new_v4()).await.is_err());
}
