//! Background re-scan
//!
//! When the rule set moves to a new version, existing connections can be
//! re-evaluated without rescanning live traffic: a work queue of
//! `(connection_id, target_version)` tasks is consumed by a small pool.
//! Tasks are idempotent; a chunk already scanned at or past the target
//! version is left alone.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::models::RowId;
use crate::persist::persister::matches_starting_in;
use crate::rules::{RuleRegistry, ScanDirection, StreamScanner};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy)]
pub struct RescanTask {
    pub connection_id: RowId,
    pub target_version: u64,
}

#[derive(Clone)]
pub struct RescanHandle {
    tx: mpsc::UnboundedSender<RescanTask>,
    storage: Storage,
}

impl RescanHandle {
    /// Queue one connection for re-scan.
    pub fn enqueue(&self, task: RescanTask) {
        let _ = self.tx.send(task);
    }

    /// Queue every finalized connection against the given version.
    pub fn enqueue_all(&self, target_version: u64) -> Result<usize> {
        let ids = self.storage.list_connection_ids()?;
        let count = ids.len();
        for connection_id in ids {
            self.enqueue(RescanTask {
                connection_id,
                target_version,
            });
        }
        info!(count, target_version, "re-scan queued");
        Ok(count)
    }
}

pub struct Rescanner {
    storage: Storage,
    registry: Arc<RuleRegistry>,
    scan_overlap_bytes: usize,
}

impl Rescanner {
    /// Spawn the worker pool; returns the enqueue handle.
    pub fn spawn(
        storage: Storage,
        registry: Arc<RuleRegistry>,
        scan_overlap_bytes: usize,
        workers: usize,
    ) -> RescanHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<RescanTask>();
        let rescanner = Arc::new(Self {
            storage: storage.clone(),
            registry,
            scan_overlap_bytes,
        });

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let permit = semaphore.clone().acquire_owned().await;
                let permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let rescanner = rescanner.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = rescanner.rescan_connection(task) {
                        error!(connection = %task.connection_id, error = %e, "re-scan failed");
                    }
                    drop(permit);
                });
            }
        });

        RescanHandle { tx, storage }
    }

    /// Re-evaluate one connection against the current database.
    ///
    /// Chunks are rewritten before the connection row, so `matched_rules`
    /// never reflects a version whose chunk matches are not yet persisted.
    pub fn rescan_connection(&self, task: RescanTask) -> Result<()> {
        let (database, version) = self.registry.current_database();
        if version < task.target_version {
            // a newer task will follow; nothing useful to do against an
            // older database
            return Ok(());
        }

        let mut matched_rules: Vec<RowId> = Vec::new();

        for from_client in [true, false] {
            let chunks = self.storage.stream_chunks(task.connection_id, from_client)?;
            if chunks.is_empty() {
                continue;
            }
            if chunks[0].scanned_version >= version {
                // already scanned at this version; keep its matches
                for chunk in &chunks {
                    for pattern_id in chunk.pattern_matches.keys() {
                        if let Some(rule) = database.rule_of_pattern(*pattern_id) {
                            matched_rules.push(rule);
                        }
                    }
                }
                continue;
            }

            let mut scanner = StreamScanner::new(
                database.clone(),
                ScanDirection::from_client(from_client),
                self.scan_overlap_bytes,
            );
            for chunk in &chunks {
                scanner.push(&chunk.payload);
            }
            let matches = scanner.finish();

            for pattern_id in matches.keys() {
                if let Some(rule) = database.rule_of_pattern(*pattern_id) {
                    matched_rules.push(rule);
                }
            }

            let mut offset = 0u64;
            for chunk in &chunks {
                let end = offset + chunk.payload.len() as u64;
                let own = matches_starting_in(&matches, offset, end);
                self.storage.update_stream_matches(chunk.id, &own, version)?;
                offset = end;
            }
        }

        matched_rules.sort();
        matched_rules.dedup();
        self.storage
            .update_connection_matched_rules(task.connection_id, &matched_rules)?;

        debug!(connection = %task.connection_id, version, "re-scan complete");
        Ok(())
    }
}
