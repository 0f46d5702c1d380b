//! Route and certificate handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, State},
    Json,
};
use keel_edge::RouteSummary;
use keel_types::CertificateSummary;

/// Routes in the active table, with TLS readiness and backends
pub async fn list_routes(State(state): State<AppState>) -> Json<Vec<RouteSummary>> {
    Json(state.control.routes())
}

pub async fn list_certificates(State(state): State<AppState>) -> Json<Vec<CertificateSummary>> {
    Json(state.control.certificates())
}

/// Obtain or renew a certificate and wait for it
pub async fn ensure_certificate(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> ApiResult<Json<CertificateSummary>> {
    let summary = state.control.ensure_certificate(&domain).await?;
    tracing::info!(%domain, not_after = %summary.not_after, "Certificate ensured");
    Ok(Json(summary))
}
