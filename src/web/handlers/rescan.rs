//! Operator-triggered re-scan

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::config::RescanPolicy;
use crate::error::{CaronteError, Result};
use crate::web::AppState;

/// Queue every finalized connection for re-scan against the current rule
/// database, independent of any rule mutation.
pub async fn trigger_rescan(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    if state.config.analysis.rescan_policy == RescanPolicy::Off {
        return Err(CaronteError::InvalidInput(
            "re-scan is disabled by configuration".into(),
        ));
    }

    let (_, version) = state.registry.current_database();
    let queued = state.rescan.enqueue_all(version)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": queued, "version": version })),
    ))
}
