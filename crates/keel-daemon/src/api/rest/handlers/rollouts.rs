//! Rollout handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use keel_rollout::RolloutRecord;
use keel_types::RolloutStatus;
use serde::Serialize;

pub async fn list_rollouts(State(state): State<AppState>) -> ApiResult<Json<Vec<RolloutStatus>>> {
    Ok(Json(state.control.list_rollouts().await?))
}

pub async fn get_rollout(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<RolloutStatus>> {
    Ok(Json(state.control.rollout_status(&name).await?))
}

/// Finished rollouts of a service
pub async fn rollout_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<RolloutRecord>>> {
    Ok(Json(state.control.rollout_history(&name).await?))
}

/// Rollback response
#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub service: String,
    pub to_version: u64,
}

pub async fn rollback_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<RollbackResponse>)> {
    let to_version = state.control.rollback(&name).await?;
    tracing::info!(service = %name, to_version, "Rollback requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(RollbackResponse {
            service: name,
            to_version,
        }),
    ))
}

pub async fn pause_rollout(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.control.pause(&name)?;
    tracing::info!(service = %name, "Rollout paused");
    Ok(StatusCode::ACCEPTED)
}

pub async fn resume_rollout(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.control.resume(&name).await?;
    tracing::info!(service = %name, "Rollout resumed");
    Ok(StatusCode::ACCEPTED)
}
