//! Pipeline engine
//!
//! Drives runs through the ordered stages. Within a run, stages execute one
//! after the other; across runs, every stage has an ordered gate so that at
//! most one run occupies it and runs pass through in commit order. A run
//! that stops early gives up its place in every later gate.

use bytes::Bytes;
use shipway_core::domain::artifact::Artifact;
use shipway_core::domain::environment::EnvironmentConfig;
use shipway_core::domain::run::{CommitRef, Run, RunResult, TriggerSource};
use shipway_core::domain::service::TargetService;
use shipway_core::domain::stage::{StageDefinition, StageKind, StageLayout, artifact_name};
use shipway_core::error::StageError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborator::cluster::ServiceState;
use crate::collaborator::source::SourceRepository;
use crate::scheduler::gate::StageGate;
use crate::service::artifacts::ArtifactStore;
use crate::service::build::BuildExecutor;
use crate::service::deploy::DeployExecutor;
use crate::service::runs::{RunEvent, RunRegistry};

/// Errors from engine operations (not from stages, which fail the run)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("run {0} not found")]
    UnknownRun(Uuid),

    #[error("run {0} was already started")]
    AlreadyStarted(Uuid),

    #[error("run {0} has already finished")]
    AlreadyFinished(Uuid),
}

/// Executors a pipeline dispatches its stages to
pub struct Executors {
    pub source: Arc<dyn SourceRepository>,
    pub build: Arc<BuildExecutor>,
    pub deploy: Arc<DeployExecutor>,
}

struct RunSlot {
    cancel: CancellationToken,
    started: bool,
}

pub struct Pipeline {
    name: String,
    layout: StageLayout,
    env: EnvironmentConfig,
    target: TargetService,
    executors: Executors,
    artifacts: ArtifactStore,
    runs: RunRegistry,
    gates: Vec<StageGate>,
    next_sequence: AtomicU64,
    slots: Mutex<HashMap<Uuid, RunSlot>>,
}

impl Pipeline {
    /// Creates a pipeline
    ///
    /// # Arguments
    /// * `name` - Pipeline name
    /// * `layout` - Validated stage layout
    /// * `env` - Environment injected into every build
    /// * `target` - Service the deploy stage rolls out to
    /// * `executors` - Stage executors
    pub fn new(
        name: impl Into<String>,
        layout: StageLayout,
        env: EnvironmentConfig,
        target: TargetService,
        executors: Executors,
    ) -> Self {
        let gates = layout.stages().iter().map(|_| StageGate::new()).collect();
        Self {
            name: name.into(),
            layout,
            env,
            target,
            executors,
            artifacts: ArtifactStore::new(),
            runs: RunRegistry::new(),
            gates,
            next_sequence: AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }

    pub fn environment(&self) -> &EnvironmentConfig {
        &self.env
    }

    pub fn target(&self) -> &TargetService {
        &self.target
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Run lifecycle
    // =========================================================================

    /// Registers a queued run for a commit
    ///
    /// The run takes the next place in every stage gate, so it must be
    /// started (or cancelled) for later runs to make progress.
    pub fn create_run(&self, commit: CommitRef, trigger: TriggerSource) -> Run {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let run = Run::new(self.name.clone(), sequence, commit, trigger, &self.layout);

        self.slots().insert(
            run.id,
            RunSlot {
                cancel: CancellationToken::new(),
                started: false,
            },
        );
        self.runs.insert(run.clone());

        info!(
            run_id = %run.id,
            commit = %run.commit,
            "Run #{} queued ({:?})",
            run.sequence,
            trigger
        );
        run
    }

    /// Executes a queued run to completion
    pub async fn start(&self, run_id: Uuid) -> Result<RunResult, PipelineError> {
        let run = self
            .runs
            .get(run_id)
            .ok_or(PipelineError::UnknownRun(run_id))?;
        if run.status.is_terminal() {
            return Err(PipelineError::AlreadyFinished(run_id));
        }

        let token = {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(&run_id)
                .ok_or(PipelineError::AlreadyFinished(run_id))?;
            if slot.started {
                return Err(PipelineError::AlreadyStarted(run_id));
            }
            slot.started = true;
            slot.cancel.clone()
        };

        let result = self.execute(&run, &token).await;
        self.slots().remove(&run_id);
        result
    }

    /// Creates a run and executes it in the background
    pub fn submit(
        self: &Arc<Self>,
        commit: CommitRef,
        trigger: TriggerSource,
    ) -> (Run, JoinHandle<Result<RunResult, PipelineError>>) {
        let run = self.create_run(commit, trigger);
        let pipeline = Arc::clone(self);
        let run_id = run.id;
        let handle = tokio::spawn(async move { pipeline.start(run_id).await });
        (run, handle)
    }

    /// Cancels a run
    ///
    /// A queued run that was never started is finished immediately. A run in
    /// flight abandons its current stage; a cancelled build never stores its
    /// artifact and a cancelled rollout stops its replacement tasks.
    pub fn cancel(&self, run_id: Uuid) -> Result<Run, PipelineError> {
        let run = self
            .runs
            .get(run_id)
            .ok_or(PipelineError::UnknownRun(run_id))?;
        if run.status.is_terminal() {
            return Err(PipelineError::AlreadyFinished(run_id));
        }

        let started = {
            let mut slots = self.slots();
            let slot = slots
                .get_mut(&run_id)
                .ok_or(PipelineError::AlreadyFinished(run_id))?;
            slot.cancel.cancel();
            std::mem::replace(&mut slot.started, true)
        };

        info!(run_id = %run_id, "Cancelling run #{}", run.sequence);

        if started {
            return Ok(run);
        }

        // Never started: nobody else will finish it
        self.slots().remove(&run_id);
        let ordinal = run.next_pending_stage().unwrap_or(0);
        self.fail(&run, ordinal, StageError::Cancelled)
            .ok_or(PipelineError::UnknownRun(run_id))
    }

    pub fn get_run(&self, run_id: Uuid) -> Option<Run> {
        self.runs.get(run_id)
    }

    /// All runs in admission order
    pub fn list_runs(&self) -> Vec<Run> {
        self.runs.list()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.runs.subscribe()
    }

    /// Current state of the target service
    pub async fn service_state(&self) -> Result<ServiceState, shipway_core::error::DeployError> {
        self.executors
            .deploy
            .cluster()
            .describe_service(&self.target)
            .await
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn execute(&self, run: &Run, cancel: &CancellationToken) -> Result<RunResult, PipelineError> {
        let run_id = run.id;

        for def in self.layout.stages() {
            let gate = &self.gates[def.ordinal];

            let pass = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.finish(run, def.ordinal, StageError::Cancelled);
                }
                pass = gate.enter(run.sequence) => pass,
            };

            let inputs = match self.inputs(run_id, &run.commit, def) {
                Ok(inputs) => inputs,
                Err(e) => {
                    drop(pass);
                    return self.finish(run, def.ordinal, e);
                }
            };

            self.runs.update(run_id, |r| r.begin_stage(def.ordinal));
            info!(
                run_id = %run_id,
                stage = %def.name,
                commit = %run.commit,
                "Stage {} started",
                def.name
            );

            let outcome = self.run_stage(run, def, &inputs, cancel).await;

            match outcome {
                Ok(content) => {
                    let produced = self.store_output(run, def, content);
                    self.runs
                        .update(run_id, |r| r.complete_stage(def.ordinal, produced));
                    info!(run_id = %run_id, stage = %def.name, "Stage {} succeeded", def.name);
                    drop(pass);
                }
                Err(e) => {
                    drop(pass);
                    return self.finish(run, def.ordinal, e);
                }
            }
        }

        let finished = self.runs.update(run_id, |r| r.succeed());
        info!(run_id = %run_id, commit = %run.commit, "Run #{} succeeded", run.sequence);
        finished
            .and_then(|r| r.result())
            .ok_or(PipelineError::UnknownRun(run_id))
    }

    /// Artifacts a stage consumes, all of which must already exist
    fn inputs(
        &self,
        run_id: Uuid,
        commit: &CommitRef,
        def: &StageDefinition,
    ) -> Result<Vec<Artifact>, StageError> {
        def.inputs
            .iter()
            .map(|input| {
                let name = artifact_name(input, &commit.commit_id);
                self.artifacts
                    .get(run_id, &name)
                    .ok_or(StageError::MissingArtifact(name))
            })
            .collect()
    }

    /// Runs one stage until it finishes or the run is cancelled
    ///
    /// Source and build are abandoned as soon as the token fires. Deploy
    /// gets the token itself: once the service has switched revisions the
    /// rollout completes regardless.
    async fn run_stage(
        &self,
        run: &Run,
        def: &StageDefinition,
        inputs: &[Artifact],
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, StageError> {
        match def.kind {
            StageKind::Source => {
                let bundle = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StageError::Cancelled),
                    bundle = self.executors.source.fetch(&run.commit) => bundle?,
                };
                Ok(Some(bundle))
            }
            StageKind::Build => {
                let source = first_input(def, inputs)?;
                let output = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StageError::Cancelled),
                    output = self.executors.build.build(run.id, &run.commit, source, &self.env) => output?,
                };
                Ok(Some(output.content))
            }
            StageKind::Deploy => {
                let build = first_input(def, inputs)?;
                let result = self
                    .executors
                    .deploy
                    .deploy(build, &self.target, cancel)
                    .await?;
                info!(
                    run_id = %run.id,
                    "Service {} now on revision {} ({})",
                    result.service,
                    result.revision,
                    result.image
                );
                Ok(None)
            }
        }
    }

    /// Stores a stage's output artifact, returning its name
    fn store_output(&self, run: &Run, def: &StageDefinition, content: Option<Bytes>) -> Option<String> {
        let (output, content) = match (&def.output, content) {
            (Some(output), Some(content)) => (output, content),
            (Some(output), None) => {
                warn!(run_id = %run.id, "Stage {} produced no '{}' artifact", def.name, output);
                return None;
            }
            (None, _) => return None,
        };

        let name = artifact_name(output, &run.commit.commit_id);
        if let Err(e) = self
            .artifacts
            .put(Artifact::new(run.id, name.clone(), def.kind, content))
        {
            warn!(run_id = %run.id, "{}", e);
        }
        Some(name)
    }

    /// Records a failure and finishes the run
    fn finish(&self, run: &Run, ordinal: usize, error: StageError) -> Result<RunResult, PipelineError> {
        self.fail(run, ordinal, error)
            .and_then(|r| r.result())
            .ok_or(PipelineError::UnknownRun(run.id))
    }

    /// Marks the run failed at `ordinal` and frees its place in every gate
    /// from there on
    fn fail(&self, run: &Run, ordinal: usize, error: StageError) -> Option<Run> {
        let stage = self
            .layout
            .stages()
            .get(ordinal)
            .map(|s| s.name.as_str())
            .unwrap_or("?");
        warn!(
            run_id = %run.id,
            stage = %stage,
            commit = %run.commit,
            "Run #{} failed: {}",
            run.sequence,
            error
        );

        let failed = self.runs.update(run.id, |r| r.fail_stage(ordinal, &error));

        for gate in self.gates.iter().skip(ordinal) {
            gate.release(run.sequence);
        }
        debug!(run_id = %run.id, "Released gates from ordinal {}", ordinal);

        failed
    }
}

fn first_input<'a>(def: &StageDefinition, inputs: &'a [Artifact]) -> Result<&'a Artifact, StageError> {
    inputs
        .first()
        .ok_or_else(|| StageError::MissingArtifact(format!("input of {}", def.name)))
}
