//! Router configuration for the dispatch service.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::handlers;
use super::request_id;
use super::AppState;

/// All routes live under the versioned base path; every one of them requires
/// `X-Request-Id`.
pub const BASE_PATH: &str = "/search-intelligence/searcher/v1";

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Admission
        .route("/prompts", post(handlers::submit_prompt))
        .route("/prompts/bulk", post(handlers::submit_bulk))
        // Job queries
        .route("/jobs", get(handlers::list_jobs))
        .route("/jobs/:job_id", get(handlers::get_job))
        // Batch queries
        .route("/batches/:batch_id", get(handlers::get_batch))
        // Health
        .route("/health", get(handlers::health))
        // Worker pool administration
        .route("/workers/:index/warmup", post(handlers::warmup_worker))
        .route("/workers/:index/restart", post(handlers::restart_worker))
        .route("/workers/:index/refresh", post(handlers::refresh_worker))
        // OpenAPI document
        .route("/docs/openapi.json", get(handlers::openapi_spec))
        .layer(middleware::from_fn(request_id::require_request_id))
        .layer(CorsLayer::permissive())
        .with_state(state);

    Router::new().nest(BASE_PATH, api)
}
