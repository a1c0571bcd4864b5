//! Route table.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Builds the application router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/api/execution-status",
            get(handlers::execution::get_status).post(handlers::execution::post_action),
        )
        .route("/api/retry", post(handlers::retry::retry))
        .route(
            "/api/stop",
            get(handlers::stop::get_stop).post(handlers::stop::request_stop),
        )
        .route("/api/stop/clear", post(handlers::stop::clear_stop))
        .route("/api/workflows/sync", post(handlers::workflows::sync))
        .route("/api/stages", get(handlers::stages::list))
        .route("/api/stages/run", post(handlers::stages::run))
        .route("/api/pipeline/run", post(handlers::stages::run_pipeline))
        .route("/api/failures", get(handlers::failures::list))
        .route("/api/failures/reset", post(handlers::failures::reset))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
