//! Service labels: port -> name and color shown by the UI

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::error::{CaronteError, Result};
use crate::models::Service;
use crate::rules::is_valid_color;
use crate::web::AppState;

pub async fn list_services(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Service>>> {
    Ok(Json(state.storage.list_services()?))
}

pub async fn put_service(
    State(state): State<Arc<AppState>>,
    Json(service): Json<Service>,
) -> Result<Json<serde_json::Value>> {
    if service.port == 0 {
        return Err(CaronteError::InvalidInput("port must be in [1, 65535]".into()));
    }
    if service.name.is_empty() {
        return Err(CaronteError::InvalidInput("service name is empty".into()));
    }
    if !is_valid_color(&service.color) {
        return Err(CaronteError::InvalidInput(format!(
            "invalid color: {}",
            service.color
        )));
    }

    state.storage.upsert_service(&service)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
