//! Run-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use shipway_core::domain::run::{Run, RunStatus};
use shipway_core::dto::artifact::ArtifactSummary;
use shipway_core::dto::run::{CommitEvent, RunSummary, TriggerRun, TriggeredRuns};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Inspection
    // =============================================================================

    /// List runs in admission order
    ///
    /// # Arguments
    /// * `status` - Only return runs in this status
    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunSummary>> {
        let url = format!("{}/api/runs", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(status) = status {
            request = request.query(&[("status", status.to_string())]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Get a run with its per-stage records
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let url = format!("{}/api/runs/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Artifacts a run has produced so far
    pub async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<ArtifactSummary>> {
        let url = format!("{}/api/runs/{}/artifacts", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Triggers
    // =============================================================================

    /// Start a run for a commit by hand
    ///
    /// # Example
    /// ```no_run
    /// # use shipway_client::OrchestratorClient;
    /// # use shipway_core::dto::run::TriggerRun;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let run = client.trigger_run(TriggerRun {
    ///     branch: None,
    ///     commit_id: "abc123".to_string(),
    /// }).await?;
    /// println!("Run #{} queued", run.sequence);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn trigger_run(&self, req: TriggerRun) -> Result<RunSummary> {
        let url = format!("{}/api/runs", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Notify the orchestrator of new commits
    ///
    /// # Returns
    /// The runs created; empty when the branch is not watched
    pub async fn notify_commits(&self, event: &CommitEvent) -> Result<TriggeredRuns> {
        let url = format!("{}/api/hooks/commit", self.base_url);
        let response = self.client.post(&url).json(event).send().await?;

        self.handle_response(response).await
    }

    /// Cancel a queued or running run
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<RunSummary> {
        let url = format!("{}/api/runs/{}/cancel", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }
}
