//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, enable_cors: bool, max_body_size: usize) -> Router {
    let api_routes = Router::new()
        // Health and status
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::daemon_status))
        // Stacks and services
        .route("/stacks", post(handlers::apply_stack))
        .route(
            "/services",
            get(handlers::list_services).post(handlers::submit_service),
        )
        .route(
            "/services/:name",
            get(handlers::get_service).delete(handlers::remove_service),
        )
        .route("/services/:name/history", get(handlers::service_history))
        // Rollouts
        .route("/rollouts", get(handlers::list_rollouts))
        .route("/services/:name/rollout", get(handlers::get_rollout))
        .route("/services/:name/rollouts", get(handlers::rollout_history))
        .route("/services/:name/rollback", post(handlers::rollback_service))
        .route("/services/:name/pause", post(handlers::pause_rollout))
        .route("/services/:name/resume", post(handlers::resume_rollout))
        // Fleet
        .route("/replicas", get(handlers::list_replicas))
        .route("/hosts", get(handlers::list_hosts).post(handlers::add_host))
        .route("/hosts/:id", axum::routing::delete(handlers::remove_host))
        .route("/hosts/:id/schedulable", put(handlers::set_schedulable))
        // Edge
        .route("/routes", get(handlers::list_routes))
        .route("/certificates", get(handlers::list_certificates))
        .route(
            "/certificates/:domain/ensure",
            post(handlers::ensure_certificate),
        )
        // Events
        .route("/events", get(handlers::get_events))
        .route("/events/stream", get(handlers::stream_events));

    let router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http());

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}
