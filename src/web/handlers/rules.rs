//! Rule CRUD

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::error::Result;
use crate::models::RowId;
use crate::rules::{Pattern, Rule, RulePatch};
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub patterns: Vec<Pattern>,
}

fn default_enabled() -> bool {
    true
}

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Vec<Rule>> {
    Json(state.registry.list_rules())
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let (_, before) = state.registry.current_database();

    let id = state.registry.add_rule(Rule {
        id: RowId::ZERO,
        name: request.name,
        color: request.color,
        notes: request.notes,
        enabled: request.enabled,
        patterns: request.patterns,
        version: 0,
    })?;

    state.maybe_rescan(before);
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(patch): Json<RulePatch>,
) -> Result<Json<serde_json::Value>> {
    let (_, before) = state.registry.current_database();

    let version = state.registry.update_rule(RowId(id), patch)?;

    state.maybe_rescan(before);
    Ok(Json(serde_json::json!({ "version": version })))
}
