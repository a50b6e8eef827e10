//! Connection listing and flags

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::{CaronteError, Result};
use crate::models::{Connection, RowId};
use crate::storage::ConnectionFilter;
use crate::web::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionsQuery {
    pub service_port: Option<u16>,
    /// Comma-separated rule ids; every one must have matched
    pub matched_rules: Option<String>,
    pub client_address: Option<String>,
    pub client_port: Option<u16>,
    /// Milliseconds
    pub min_duration: Option<i64>,
    pub max_duration: Option<i64>,
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
    /// Unix milliseconds
    pub started_after: Option<i64>,
    pub started_before: Option<i64>,
    pub closed_after: Option<i64>,
    pub closed_before: Option<i64>,
    pub marked: Option<bool>,
    pub hidden: Option<bool>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    #[serde(default)]
    pub limit: usize,
}

impl ConnectionsQuery {
    fn into_filter(self) -> Result<ConnectionFilter> {
        let matched_rules = match &self.matched_rules {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.trim()
                        .parse::<i64>()
                        .map(RowId)
                        .map_err(|_| CaronteError::InvalidInput(format!("bad rule id: {}", s)))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(ConnectionFilter {
            service_port: self.service_port,
            matched_rules,
            client_address: self.client_address,
            client_port: self.client_port,
            min_duration_ms: self.min_duration,
            max_duration_ms: self.max_duration,
            min_bytes: self.min_bytes,
            max_bytes: self.max_bytes,
            started_after: self.started_after.map(millis).transpose()?,
            started_before: self.started_before.map(millis).transpose()?,
            closed_after: self.closed_after.map(millis).transpose()?,
            closed_before: self.closed_before.map(millis).transpose()?,
            marked: self.marked,
            hidden: self.hidden,
            from: self.from.map(RowId),
            to: self.to.map(RowId),
            limit: self.limit,
        })
    }
}

fn millis(value: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| CaronteError::InvalidInput(format!("bad timestamp: {}", value)))
}

pub async fn list_connections(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectionsQuery>,
) -> Result<Json<Vec<Connection>>> {
    let filter = query.into_filter()?;
    Ok(Json(state.storage.list_connections(&filter)?))
}

pub async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Connection>> {
    state
        .storage
        .get_connection(RowId(id))?
        .map(Json)
        .ok_or_else(|| CaronteError::NotFound(format!("connection {}", id)))
}

pub async fn connection_action(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(i64, String)>,
) -> Result<Json<serde_json::Value>> {
    let id = RowId(id);
    match action.as_str() {
        "mark" => state.storage.set_connection_marked(id, true)?,
        "unmark" => state.storage.set_connection_marked(id, false)?,
        "hide" => state.storage.set_connection_hidden(id, true)?,
        "show" => state.storage.set_connection_hidden(id, false)?,
        other => {
            return Err(CaronteError::InvalidInput(format!(
                "unknown action: {}",
                other
            )))
        }
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}
