//! Bootstrap endpoint

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::error::{CaronteError, Result};
use crate::models::{RowId, Settings};
use crate::rules::{Pattern, PatternFlags, Rule};
use crate::web::AppState;

const MIN_FLAG_REGEX_LEN: usize = 8;

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub server_address: String,
    pub flag_regex: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub accounts: HashMap<String, String>,
}

pub async fn setup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetupRequest>,
) -> Result<StatusCode> {
    if request.server_address.parse::<IpAddr>().is_err() {
        return Err(CaronteError::InvalidInput(format!(
            "server_address is not a valid IP: {}",
            request.server_address
        )));
    }
    if request.flag_regex.len() < MIN_FLAG_REGEX_LEN {
        return Err(CaronteError::InvalidInput(format!(
            "flag_regex must be at least {} characters",
            MIN_FLAG_REGEX_LEN
        )));
    }

    let flag_rule = Rule {
        id: RowId::ZERO,
        name: "flag".into(),
        color: "#e53935".into(),
        notes: "seeded by setup".into(),
        enabled: true,
        patterns: vec![Pattern {
            regex: request.flag_regex.clone(),
            flags: PatternFlags::default(),
        }],
        version: 0,
    };
    flag_rule.validate()?;

    state.storage.put_settings(&Settings {
        server_address: request.server_address,
        flag_regex: request.flag_regex,
        auth_required: request.auth_required,
        accounts: request.accounts,
    })?;

    // Seed the flag rule unless one with the name already exists
    match state.registry.add_rule(flag_rule) {
        Ok(id) => info!(rule = %id, "flag rule seeded"),
        Err(CaronteError::Conflict(_)) => {}
        Err(e) => return Err(e),
    }

    Ok(StatusCode::CREATED)
}
