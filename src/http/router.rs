//! Router configuration for the HTTP API.
//!
//! This module sets up all routes, middleware (CORS, compression, tracing),
//! and creates the axum router ready for serving.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::state::AppState;

/// Create the main application router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration - permissive for development, should be restricted in production
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the API router with versioned endpoints
    let api_v1 = Router::new()
        // Notice ingestion
        .route("/gcn", post(handlers::ingest_notice))
        // Events
        .route("/events", get(handlers::list_events))
        .route("/events/{dateobs}", get(handlers::get_event))
        // Localizations
        .route(
            "/events/{dateobs}/localizations",
            get(handlers::list_localizations).post(handlers::acquire_localization),
        )
        .route(
            "/events/{dateobs}/localizations/{name}",
            get(handlers::get_localization),
        )
        .route(
            "/events/{dateobs}/localizations/{name}/contour",
            get(handlers::get_contour),
        )
        // Plans
        .route(
            "/events/{dateobs}/plans",
            get(handlers::list_plans).post(handlers::generate_plan),
        )
        .route(
            "/events/{dateobs}/plans/{telescope}/{plan}",
            get(handlers::get_plan).delete(handlers::delete_plan),
        )
        .route(
            "/events/{dateobs}/plans/{telescope}/{plan}/export",
            get(handlers::export_plan),
        )
        .route(
            "/events/{dateobs}/plans/{telescope}/{plan}/summary",
            get(handlers::get_plan_summary),
        )
        .route(
            "/events/{dateobs}/plans/{telescope}/{plan}/submit",
            post(handlers::submit_plan),
        )
        // Telescopes
        .route("/telescopes", get(handlers::list_telescopes))
        .route("/telescopes/{name}/fields", get(handlers::get_telescope_fields))
        // Job management
        .route("/jobs/{job_id}", get(handlers::get_job_status))
        .route("/jobs/{job_id}/logs", get(handlers::stream_job_logs));

    // Combine all routes
    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/v1", api_v1)
        // Allow large notice and map payloads during uploads.
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::LocalRepository;
    use std::sync::Arc;

    #[test]
    fn test_router_creation() {
        let repo = Arc::new(LocalRepository::new()) as Arc<dyn crate::db::FullRepository>;
        let state = AppState::new(repo, AppConfig::default());
        let _router = create_router(state);
        // If we got here, router was created successfully
    }
}
