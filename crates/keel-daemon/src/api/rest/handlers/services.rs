//! Service and stack handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use keel_control::{ServiceView, StackReport, SubmitReport};
use keel_types::ServiceSpec;

/// Apply a YAML stack descriptor
pub async fn apply_stack(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<(StatusCode, Json<StackReport>)> {
    let report = state.control.apply_stack(&body).await?;
    tracing::info!(
        services = report.services.len(),
        configs = report.configs.len(),
        "Applied stack"
    );
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// List the latest spec of every service
pub async fn list_services(State(state): State<AppState>) -> ApiResult<Json<Vec<ServiceView>>> {
    Ok(Json(state.control.list_services().await?))
}

/// Submit one service spec
pub async fn submit_service(
    State(state): State<AppState>,
    Json(spec): Json<ServiceSpec>,
) -> ApiResult<(StatusCode, Json<SubmitReport>)> {
    let report = state.control.submit_service(spec).await?;
    let status = if report.registry.is_change() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

pub async fn get_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ServiceView>> {
    Ok(Json(state.control.get_service(&name).await?))
}

/// Every stored version, oldest first
pub async fn service_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<ServiceSpec>>> {
    Ok(Json(state.control.service_history(&name).await?))
}

pub async fn remove_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.control.remove_service(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
