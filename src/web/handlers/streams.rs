//! Stream reader endpoint

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;

use crate::error::{CaronteError, Result};
use crate::models::RowId;
use crate::streams::{CancelToken, Payload, QueryFormat};
use crate::web::AppState;

/// Deadline for one merge before the read is cancelled
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a cancelled read gets to notice the flag and hand back its prefix
const CANCEL_GRACE: Duration = Duration::from_secs(2);

pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<i64>,
    Query(query): Query<QueryFormat>,
) -> Result<Json<Vec<Payload>>> {
    let connection_id = RowId(connection_id);
    if state.storage.get_connection(connection_id)?.is_none() {
        return Err(CaronteError::NotFound(format!(
            "connection {}",
            connection_id
        )));
    }

    // The merge reads chunk documents from the store; keep it off the
    // async workers.
    let reader = state.reader.clone();
    let cancel = CancelToken::new();
    let read_cancel = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || {
        reader.get_connection_payload(connection_id, &query, &read_cancel)
    });

    let joined = match tokio::time::timeout(STREAM_READ_TIMEOUT, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            // Deadline passed: raise the flag. The read checks it between
            // chunk loads and returns the prefix it accumulated past `skip`,
            // or empty.
            cancel.cancel();
            match tokio::time::timeout(CANCEL_GRACE, &mut task).await {
                Ok(joined) => joined,
                Err(_) => return Err(CaronteError::Cancelled),
            }
        }
    };

    let payloads = joined
        .map_err(|e| CaronteError::Internal(format!("stream read panicked: {}", e)))??;
    Ok(Json(payloads))
}
