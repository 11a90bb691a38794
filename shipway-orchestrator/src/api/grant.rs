//! Grant API Handlers

use axum::{Json, extract::State};
use shipway_core::domain::grant::Grant;

use crate::api::AppState;

/// GET /api/grants
/// Effective grants established by the access policy binder
pub async fn list_grants(State(state): State<AppState>) -> Json<Vec<Grant>> {
    Json(state.binder.grants())
}
