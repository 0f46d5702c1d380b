//! Host inventory and replica handlers

use crate::api::rest::state::AppState;
use crate::config::HostEntry;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use keel_types::{Host, HostId, ReplicaInstance};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ReplicaQuery {
    pub service: Option<String>,
}

pub async fn list_replicas(
    State(state): State<AppState>,
    Query(query): Query<ReplicaQuery>,
) -> Json<Vec<ReplicaInstance>> {
    Json(state.control.replicas(query.service.as_deref()))
}

pub async fn list_hosts(State(state): State<AppState>) -> ApiResult<Json<Vec<Host>>> {
    Ok(Json(state.control.list_hosts().await?))
}

/// Add or replace an inventory host
pub async fn add_host(
    State(state): State<AppState>,
    Json(entry): Json<HostEntry>,
) -> ApiResult<(StatusCode, Json<Host>)> {
    let host = entry.to_host().map_err(ApiError::BadRequest)?;
    state.control.add_host(host.clone()).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

pub async fn remove_host(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.control.remove_host(&HostId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SchedulableRequest {
    pub schedulable: bool,
}

/// Cordon or uncordon a host
pub async fn set_schedulable(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SchedulableRequest>,
) -> ApiResult<StatusCode> {
    state
        .control
        .set_schedulable(&HostId::new(id.clone()), request.schedulable)
        .await?;
    tracing::info!(host = %id, schedulable = request.schedulable, "Host schedulability changed");
    Ok(StatusCode::NO_CONTENT)
}
