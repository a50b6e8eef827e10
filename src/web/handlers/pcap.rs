//! Capture session endpoints

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::error::{CaronteError, Result};
use crate::models::{PcapSession, RowId};
use crate::web::AppState;

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PcapSession>>> {
    Ok(Json(state.sessions.list_sessions()?))
}

/// Multipart upload: `file` holds the capture, `flush_all` an optional
/// boolean field.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<PcapSession>)> {
    let mut file: Option<Vec<u8>> = None;
    let mut flush_all = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CaronteError::InvalidInput(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| CaronteError::InvalidInput(format!("bad file field: {}", e)))?;
                file = Some(bytes.to_vec());
            }
            "flush_all" => {
                let text = field.text().await.unwrap_or_default();
                flush_all = text == "true" || text == "1";
            }
            _ => {}
        }
    }

    let bytes = file.ok_or_else(|| CaronteError::InvalidInput("missing file field".into()))?;
    let session = state.sessions.upload_session(bytes, flush_all).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Debug, Deserialize)]
pub struct InterfaceRequest {
    pub interface: String,
}

/// Start a live capture session on a network device.
pub async fn start_interface(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InterfaceRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    if request.interface.is_empty() {
        return Err(CaronteError::InvalidInput("interface is empty".into()));
    }
    let (id, _done) = state
        .sessions
        .clone()
        .start_interface_session(request.interface)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

/// Stop a running live capture session.
pub async fn stop_interface(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.sessions.stop_interface_session(RowId(id))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct FileRequest {
    pub file: String,
    #[serde(default)]
    pub flush_all: bool,
    #[serde(default)]
    pub delete_original_file: bool,
}

pub async fn process_file(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FileRequest>,
) -> Result<(StatusCode, Json<PcapSession>)> {
    let session = state
        .sessions
        .file_session(&request.file, request.flush_all, request.delete_original_file)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn download_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let bytes = state.sessions.download_session(RowId(id)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.tcpdump.pcap".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.pcap\"", id),
            ),
        ],
        bytes,
    ))
}
