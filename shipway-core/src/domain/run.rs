//! Run domain types
//!
//! A run is one execution of the pipeline for one commit. It is created when
//! a commit is accepted, mutated only by the pipeline engine, and kept after
//! it reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::stage::{StageKind, StageLayout};
use crate::error::{ErrorKind, StageError};

/// Exact commit on a branch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef {
    pub branch: String,
    pub commit_id: String,
}

impl CommitRef {
    pub fn new(branch: impl Into<String>, commit_id: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit_id: commit_id.into(),
        }
    }
}

impl std::fmt::Display for CommitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.branch, self.commit_id)
    }
}

/// What created a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    Poller,
    Webhook,
    Manual,
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "Queued"),
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Succeeded => write!(f, "Succeeded"),
            RunStatus::Failed => write!(f, "Failed"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Status of one stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Never reached because an earlier stage did not succeed
    Skipped,
}

/// Why a stage failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StageError> for StageFailure {
    fn from(err: &StageError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Per-stage record kept on the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub ordinal: usize,
    pub kind: StageKind,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Name of the artifact the stage produced
    pub artifact: Option<String>,
    pub failure: Option<StageFailure>,
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result")]
pub enum RunOutcome {
    Succeeded,
    Failed {
        stage: StageKind,
        stage_name: String,
        kind: ErrorKind,
        message: String,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "Succeeded"),
            RunOutcome::Failed { stage, kind, .. } => write!(f, "Failed({}, {})", stage, kind),
        }
    }
}

/// Value returned when a run finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
}

/// One execution of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline: String,
    /// Admission order within the pipeline
    pub sequence: u64,
    pub commit: CommitRef,
    pub trigger: TriggerSource,
    pub status: RunStatus,
    /// Ordinal of the stage currently running
    pub current_stage: Option<usize>,
    pub stages: Vec<StageRecord>,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl Run {
    /// Creates a queued run with every stage pending
    pub fn new(
        pipeline: impl Into<String>,
        sequence: u64,
        commit: CommitRef,
        trigger: TriggerSource,
        layout: &StageLayout,
    ) -> Self {
        let stages = layout
            .stages()
            .iter()
            .map(|def| StageRecord {
                name: def.name.clone(),
                ordinal: def.ordinal,
                kind: def.kind,
                status: StageStatus::Pending,
                started_at: None,
                completed_at: None,
                artifact: None,
                failure: None,
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            sequence,
            commit,
            trigger,
            status: RunStatus::Queued,
            current_stage: None,
            stages,
            requested_at: Utc::now(),
            started_at: None,
            completed_at: None,
            outcome: None,
        }
    }

    /// Marks a stage as running
    pub fn begin_stage(&mut self, ordinal: usize) {
        let now = Utc::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = RunStatus::Running;
        self.current_stage = Some(ordinal);

        if let Some(stage) = self.stages.get_mut(ordinal) {
            stage.status = StageStatus::Running;
            stage.started_at = Some(now);
        }
    }

    /// Marks a stage as succeeded, recording the artifact it produced
    pub fn complete_stage(&mut self, ordinal: usize, artifact: Option<String>) {
        if let Some(stage) = self.stages.get_mut(ordinal) {
            stage.status = StageStatus::Succeeded;
            stage.completed_at = Some(Utc::now());
            stage.artifact = artifact;
        }
        self.current_stage = None;
    }

    /// Marks a stage as failed and the run as terminal
    ///
    /// A cancellation marks the run Cancelled; every other error marks it
    /// Failed. Later stages become Skipped.
    pub fn fail_stage(&mut self, ordinal: usize, error: &StageError) {
        let now = Utc::now();
        let failure = StageFailure::from(error);
        let cancelled = matches!(error, StageError::Cancelled);

        let (kind, name) = match self.stages.get_mut(ordinal) {
            Some(stage) => {
                stage.status = if cancelled {
                    StageStatus::Cancelled
                } else {
                    StageStatus::Failed
                };
                if stage.started_at.is_none() {
                    stage.started_at = Some(now);
                }
                stage.completed_at = Some(now);
                stage.failure = Some(failure.clone());
                (stage.kind, stage.name.clone())
            }
            None => return,
        };

        for later in self.stages.iter_mut().skip(ordinal + 1) {
            later.status = StageStatus::Skipped;
        }

        self.status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        self.current_stage = None;
        self.completed_at = Some(now);
        self.outcome = Some(RunOutcome::Failed {
            stage: kind,
            stage_name: name,
            kind: failure.kind,
            message: failure.message,
        });
    }

    /// Marks the run as succeeded
    pub fn succeed(&mut self) {
        self.status = RunStatus::Succeeded;
        self.current_stage = None;
        self.completed_at = Some(Utc::now());
        self.outcome = Some(RunOutcome::Succeeded);
    }

    /// First stage that has not yet succeeded
    pub fn next_pending_stage(&self) -> Option<usize> {
        self.stages
            .iter()
            .find(|s| s.status != StageStatus::Succeeded)
            .map(|s| s.ordinal)
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn result(&self) -> Option<RunResult> {
        self.outcome.clone().map(|outcome| RunResult {
            run_id: self.id,
            outcome,
        })
    }
}
