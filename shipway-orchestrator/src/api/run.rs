//! Run API Handlers
//!
//! HTTP endpoints for inspecting, triggering and cancelling runs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use shipway_core::domain::run::{CommitRef, Run, RunStatus, TriggerSource};
use shipway_core::dto::artifact::ArtifactSummary;
use shipway_core::dto::run::{CommitEvent, RunSummary, TriggerRun, TriggeredRuns};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

// =============================================================================
// Inspection
// =============================================================================

/// Query parameters for listing runs
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Only return runs in this status
    pub status: Option<RunStatus>,
}

/// GET /api/runs
/// List runs in admission order
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsQuery>,
) -> Json<Vec<RunSummary>> {
    tracing::debug!("Listing runs (status filter: {:?})", params.status);

    let runs = state
        .pipeline
        .list_runs()
        .iter()
        .filter(|run| params.status.is_none_or(|status| run.status == status))
        .map(RunSummary::from)
        .collect();

    Json(runs)
}

/// GET /api/runs/{id}
pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);

    state
        .pipeline
        .get_run(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))
}

/// GET /api/runs/{id}/artifacts
/// Metadata of the artifacts a run has produced so far
pub async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ArtifactSummary>>> {
    if state.pipeline.get_run(id).is_none() {
        return Err(ApiError::NotFound(format!("Run {} not found", id)));
    }

    let artifacts = state
        .pipeline
        .artifacts()
        .list(id)
        .iter()
        .map(ArtifactSummary::from)
        .collect();

    Ok(Json(artifacts))
}

// =============================================================================
// Triggers
// =============================================================================

/// POST /api/runs
/// Start a run for a commit by hand
pub async fn trigger_run(
    State(state): State<AppState>,
    Json(req): Json<TriggerRun>,
) -> ApiResult<(StatusCode, Json<RunSummary>)> {
    let commit_id = req.commit_id.trim();
    if commit_id.is_empty() {
        return Err(ApiError::BadRequest("commit_id must not be empty".to_string()));
    }

    let branch = req
        .branch
        .unwrap_or_else(|| state.listener.branch().to_string());
    tracing::info!("Manual trigger for {}@{}", branch, commit_id);

    let run = state
        .listener
        .accept(CommitRef::new(branch.clone(), commit_id), TriggerSource::Manual)
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "Branch {} is not watched (pipeline follows {})",
                branch,
                state.listener.branch()
            ))
        })?;

    Ok((StatusCode::ACCEPTED, Json(RunSummary::from(&run))))
}

/// POST /api/hooks/commit
/// "New commits" notification from the source repository
///
/// Every commit on the watched branch yields its own run; events for other
/// branches are acknowledged and ignored.
pub async fn commit_hook(
    State(state): State<AppState>,
    Json(event): Json<CommitEvent>,
) -> (StatusCode, Json<TriggeredRuns>) {
    tracing::info!(
        "Commit hook: {} commit(s) on {}",
        event.commits.len(),
        event.branch
    );

    let runs = state
        .listener
        .accept_all(event.commit_refs(), TriggerSource::Webhook);

    (
        StatusCode::ACCEPTED,
        Json(TriggeredRuns {
            runs: runs.iter().map(RunSummary::from).collect(),
        }),
    )
}

// =============================================================================
// Cancellation
// =============================================================================

/// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunSummary>> {
    tracing::info!("Cancel requested for run: {}", id);

    let run = state.pipeline.cancel(id)?;
    Ok(Json(RunSummary::from(&run)))
}
