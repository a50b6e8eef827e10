//! HTTP/JSON surface
//!
//! Serves rules, connections, streams and capture sessions to the analyst
//! UI. Routing and handler layout follow one router with per-area handler
//! modules; errors map onto status codes by kind.

pub mod handlers;
pub mod state;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::error::CaronteError;

pub use state::AppState;

impl IntoResponse for CaronteError {
    fn into_response(self) -> Response {
        let status = match &self {
            CaronteError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CaronteError::NotFound(_) => StatusCode::NOT_FOUND,
            CaronteError::Conflict(_) => StatusCode::CONFLICT,
            CaronteError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            CaronteError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CaronteError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CaronteError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Setup
        .route("/setup", post(handlers::setup::setup))
        // Rules
        .route(
            "/api/rules",
            get(handlers::rules::list_rules).post(handlers::rules::create_rule),
        )
        .route("/api/rules/{id}", put(handlers::rules::update_rule))
        .route("/api/rescan", post(handlers::rescan::trigger_rescan))
        // Connections
        .route("/api/connections", get(handlers::connections::list_connections))
        .route("/api/connections/{id}", get(handlers::connections::get_connection))
        .route(
            "/api/connections/{id}/{action}",
            post(handlers::connections::connection_action),
        )
        // Streams
        .route("/api/streams/{connection_id}", get(handlers::streams::get_stream))
        // Pcap sessions
        .route("/api/pcap/sessions", get(handlers::pcap::list_sessions))
        .route(
            "/api/pcap/sessions/{id}/download",
            get(handlers::pcap::download_session),
        )
        .route("/api/pcap/upload", post(handlers::pcap::upload))
        .route("/api/pcap/file", post(handlers::pcap::process_file))
        .route("/api/pcap/interface", post(handlers::pcap::start_interface))
        .route(
            "/api/pcap/interface/{id}/stop",
            post(handlers::pcap::stop_interface),
        )
        // Services
        .route(
            "/api/services",
            get(handlers::services::list_services).put(handlers::services::put_service),
        )
        .layer(cors)
        .with_state(state)
}
