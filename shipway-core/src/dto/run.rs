//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{CommitRef, Run, RunOutcome, RunStatus};

/// Request to start a run for a commit by hand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRun {
    /// Defaults to the pipeline's branch
    pub branch: Option<String>,
    pub commit_id: String,
}

/// "New commits" notification pushed by the source repository
///
/// Commits are listed oldest first; every one of them yields its own run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitEvent {
    pub branch: String,
    pub commits: Vec<String>,
}

impl CommitEvent {
    pub fn commit_refs(&self) -> Vec<CommitRef> {
        self.commits
            .iter()
            .map(|id| CommitRef::new(self.branch.clone(), id.clone()))
            .collect()
    }
}

/// Summary information about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub sequence: u64,
    pub commit: CommitRef,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        RunSummary {
            id: run.id,
            sequence: run.sequence,
            commit: run.commit.clone(),
            status: run.status,
            current_stage: run
                .current_stage
                .and_then(|ordinal| run.stages.get(ordinal))
                .map(|stage| stage.name.clone()),
            requested_at: run.requested_at,
            completed_at: run.completed_at,
            outcome: run.outcome.clone(),
        }
    }
}

/// Runs created from one commit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredRuns {
    pub runs: Vec<RunSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::TriggerSource;
    use crate::domain::stage::StageLayout;

    #[test]
    fn test_commit_event_keeps_order() {
        let event = CommitEvent {
            branch: "main".to_string(),
            commits: vec!["a1".to_string(), "b2".to_string()],
        };
        let refs = event.commit_refs();
        assert_eq!(refs[0], CommitRef::new("main", "a1"));
        assert_eq!(refs[1], CommitRef::new("main", "b2"));
    }

    #[test]
    fn test_run_summary_conversion() {
        let mut run = Run::new(
            "veengu",
            4,
            CommitRef::new("main", "abc123"),
            TriggerSource::Webhook,
            &StageLayout::standard(),
        );
        run.begin_stage(1);

        let summary = RunSummary::from(&run);
        assert_eq!(summary.id, run.id);
        assert_eq!(summary.sequence, 4);
        assert_eq!(summary.status, RunStatus::Running);
        assert_eq!(summary.current_stage.as_deref(), Some("BuildStage"));
    }
}
