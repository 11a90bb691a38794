//! Target Service API Handler
//!
//! Reports what the cluster is currently serving.

use axum::{Json, extract::State};
use shipway_core::dto::service::{ServiceStatus, TaskSummary};
use shipway_pipeline::collaborator::ServiceState;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /api/service
pub async fn get_service(State(state): State<AppState>) -> ApiResult<Json<ServiceStatus>> {
    let observed = state.pipeline.service_state().await?;
    let target = state.pipeline.target();

    Ok(Json(service_status(
        &target.cluster,
        &target.name,
        target.endpoint.clone(),
        observed,
    )))
}

fn service_status(
    cluster: &str,
    service: &str,
    endpoint: Option<String>,
    observed: ServiceState,
) -> ServiceStatus {
    let healthy_count = observed.healthy_count();

    ServiceStatus {
        cluster: cluster.to_string(),
        service: service.to_string(),
        task_definition: observed.task_definition.reference(),
        image: observed.task_definition.container.image.clone(),
        desired_count: observed.desired_count,
        healthy_count,
        endpoint,
        tasks: observed
            .tasks
            .into_iter()
            .map(|task| TaskSummary {
                id: task.id.to_string(),
                revision: task.revision,
                image: task.image,
                health: format!("{:?}", task.health),
            })
            .collect(),
    }
}
