//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod grant;
pub mod health;
pub mod run;
pub mod service;

use axum::{
    Router,
    routing::{get, post},
};
use shipway_pipeline::service::binder::AccessPolicyBinder;
use shipway_pipeline::{Pipeline, Topology, TriggerListener};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub binder: Arc<AccessPolicyBinder>,
    pub listener: Arc<TriggerListener>,
}

impl From<&Topology> for AppState {
    fn from(topology: &Topology) -> Self {
        Self {
            pipeline: Arc::clone(&topology.pipeline),
            binder: Arc::clone(&topology.binder),
            listener: Arc::clone(&topology.listener),
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Run endpoints
        .route("/api/runs", get(run::list_runs).post(run::trigger_run))
        .route("/api/runs/{id}", get(run::get_run))
        .route("/api/runs/{id}/cancel", post(run::cancel_run))
        .route("/api/runs/{id}/artifacts", get(run::list_artifacts))
        .route("/api/hooks/commit", post(run::commit_hook))
        // Access policy and target service
        .route("/api/grants", get(grant::list_grants))
        .route("/api/service", get(service::get_service))
        // Add state and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
