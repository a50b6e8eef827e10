//! Connection finalizer
//!
//! Consolidates both persisted half-streams of a terminated flow into one
//! Connection row with aggregate statistics. Finalization is keyed by the
//! connection id allocated at flow creation: replaying a flow that was
//! already finalized is a no-op.

use chrono::Utc;
use tracing::info;

use crate::assembly::CompletedFlow;
use crate::error::Result;
use crate::models::{Connection, RowId};
use crate::storage::Storage;

pub struct Finalizer {
    storage: Storage,
}

impl Finalizer {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Insert the connection record for a persisted flow.
    pub fn finalize(
        &self,
        flow: &CompletedFlow,
        client_documents: usize,
        server_documents: usize,
        matched_rules: Vec<RowId>,
    ) -> Result<RowId> {
        let first_timestamps = [
            flow.client.blocks.first().map(|b| b.timestamp),
            flow.server.blocks.first().map(|b| b.timestamp),
        ];
        let last_timestamps = [
            flow.client.blocks.last().map(|b| b.timestamp),
            flow.server.blocks.last().map(|b| b.timestamp),
        ];

        let now = Utc::now();
        let started_at = first_timestamps.iter().flatten().min().copied().unwrap_or(now);
        let closed_at = last_timestamps.iter().flatten().max().copied().unwrap_or(started_at);

        let connection = Connection {
            id: flow.connection_id,
            ip_src: flow.client_ip,
            port_src: flow.client_port,
            ip_dst: flow.server_ip,
            port_dst: flow.server_port,
            started_at,
            closed_at,
            client_bytes: flow.client.bytes.len() as u64,
            server_bytes: flow.server.bytes.len() as u64,
            client_documents,
            server_documents,
            processed_at: now,
            matched_rules,
            service_port: flow.service_port,
            marked: false,
            hidden: false,
        };

        let inserted = self.storage.insert_connection_if_absent(&connection)?;
        if inserted {
            info!(
                connection = %connection.id,
                service = connection.service_port,
                client_bytes = connection.client_bytes,
                server_bytes = connection.server_bytes,
                rules = connection.matched_rules.len(),
                "connection finalized"
            );
        }
        Ok(connection.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{BlockMeta, FinishedStream};
    use chrono::TimeZone;

    fn ts(millis: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn make_flow() -> CompletedFlow {
        CompletedFlow {
            connection_id: RowId(7),
            client_ip: "192.168.1.100".parse().unwrap(),
            client_port: 43210,
            server_ip: "10.0.0.1".parse().unwrap(),
            server_port: 8080,
            service_port: 8080,
            client: FinishedStream {
                bytes: b"request".to_vec(),
                blocks: vec![BlockMeta { start: 0, timestamp: ts(100), loss: false }],
            },
            server: FinishedStream {
                bytes: b"response".to_vec(),
                blocks: vec![
                    BlockMeta { start: 0, timestamp: ts(50), loss: false },
                    BlockMeta { start: 4, timestamp: ts(900), loss: false },
                ],
            },
        }
    }

    #[test]
    fn test_aggregates() {
        let storage = Storage::open_memory().unwrap();
        let finalizer = Finalizer::new(storage.clone());

        let id = finalizer.finalize(&make_flow(), 1, 1, vec![RowId(3)]).unwrap();
        let connection = storage.get_connection(id).unwrap().unwrap();

        // earliest first block across sides, latest last block
        assert_eq!(connection.started_at, ts(50));
        assert_eq!(connection.closed_at, ts(900));
        assert!(connection.started_at <= connection.closed_at);
        assert_eq!(connection.client_bytes, 7);
        assert_eq!(connection.server_bytes, 8);
        assert_eq!(connection.matched_rules, vec![RowId(3)]);
    }

    #[test]
    fn test_idempotent() {
        let storage = Storage::open_memory().unwrap();
        let finalizer = Finalizer::new(storage.clone());

        finalizer.finalize(&make_flow(), 1, 1, vec![]).unwrap();
        // replay with different matched rules must not overwrite
        finalizer.finalize(&make_flow(), 1, 1, vec![RowId(9)]).unwrap();

        let connection = storage.get_connection(RowId(7)).unwrap().unwrap();
        assert!(connection.matched_rules.is_empty());
        assert_eq!(storage.list_connections(&Default::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_one_sided_flow() {
        let storage = Storage::open_memory().unwrap();
        let finalizer = Finalizer::new(storage.clone());

        let mut flow = make_flow();
        flow.server = FinishedStream { bytes: vec![], blocks: vec![] };

        let id = finalizer.finalize(&flow, 1, 0, vec![]).unwrap();
        let connection = storage.get_connection(id).unwrap().unwrap();
        assert_eq!(connection.started_at, ts(100));
        assert_eq!(connection.closed_at, ts(100));
        assert_eq!(connection.server_documents, 0);
    }
}
