//! Stream persister
//!
//! Splits a terminated half-stream into chunks of at most `max_chunk_bytes`,
//! carrying the block arrays across the cuts, and attaches each pattern match
//! to the first chunk containing its start offset. Matches keep flow-global
//! offsets. Store writes are retried with exponential backoff before the
//! session is considered failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::assembly::{BlockMeta, CompletedFlow, FinishedStream};
use crate::error::{CaronteError, Result};
use crate::models::{ConnectionStream, PatternSlice, RowId};
use crate::rules::{RuleDatabase, RuleRegistry, ScanDirection, StreamScanner};
use crate::storage::Storage;

use super::finalizer::Finalizer;

#[derive(Debug, Clone)]
pub struct PersisterConfig {
    pub max_chunk_bytes: usize,
    pub scan_overlap_bytes: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 64 * 1024,
            scan_overlap_bytes: 4096,
            retry_attempts: 5,
            retry_base_delay: Duration::from_millis(50),
        }
    }
}

pub struct Persister {
    storage: Storage,
    registry: Arc<RuleRegistry>,
    finalizer: Finalizer,
    config: PersisterConfig,
}

impl Persister {
    pub fn new(storage: Storage, registry: Arc<RuleRegistry>, config: PersisterConfig) -> Self {
        Self {
            finalizer: Finalizer::new(storage.clone()),
            storage,
            registry,
            config,
        }
    }

    /// Consume completed flows until the assembler side closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<CompletedFlow>) {
        while let Some(flow) = rx.recv().await {
            let persister = self.clone();
            let result =
                tokio::task::spawn_blocking(move || persister.persist_flow(flow)).await;
            match result {
                Ok(Ok(id)) => debug!(connection = %id, "flow persisted"),
                Ok(Err(e)) => error!(error = %e, "failed to persist flow"),
                Err(e) => error!(error = %e, "persist task panicked"),
            }
        }
        info!("persister channel closed");
    }

    /// Persist both half-streams and finalize the connection record.
    pub fn persist_flow(&self, flow: CompletedFlow) -> Result<RowId> {
        let (database, version) = self.registry.current_database();

        let client_matches = self.scan_side(&database, ScanDirection::Client, &flow.client.bytes);
        let server_matches = self.scan_side(&database, ScanDirection::Server, &flow.server.bytes);

        let client_chunks = self.build_chunks(
            flow.connection_id,
            true,
            &flow.client,
            &client_matches,
            version,
        )?;
        let server_chunks = self.build_chunks(
            flow.connection_id,
            false,
            &flow.server,
            &server_matches,
            version,
        )?;

        for chunk in client_chunks.iter().chain(server_chunks.iter()) {
            self.write_chunk(chunk)?;
        }

        let mut matched_rules: Vec<RowId> = client_matches
            .keys()
            .chain(server_matches.keys())
            .filter_map(|&pattern_id| database.rule_of_pattern(pattern_id))
            .collect();
        matched_rules.sort();
        matched_rules.dedup();

        self.finalizer.finalize(
            &flow,
            client_chunks.len(),
            server_chunks.len(),
            matched_rules,
        )
    }

    /// Scan one side's full bytes, streamed in chunk-sized pushes.
    fn scan_side(
        &self,
        database: &Arc<RuleDatabase>,
        direction: ScanDirection,
        bytes: &[u8],
    ) -> HashMap<u64, Vec<PatternSlice>> {
        let mut scanner = StreamScanner::new(
            database.clone(),
            direction,
            self.config.scan_overlap_bytes,
        );
        for chunk in bytes.chunks(self.config.max_chunk_bytes.max(1)) {
            scanner.push(chunk);
        }
        scanner.finish()
    }

    /// Split a finished half-stream into chunk documents.
    ///
    /// Chunk cuts respect block boundaries; a block larger than the chunk
    /// budget is split into continuation blocks that start the next chunk.
    fn build_chunks(
        &self,
        connection_id: RowId,
        from_client: bool,
        stream: &FinishedStream,
        matches: &HashMap<u64, Vec<PatternSlice>>,
        scanned_version: u64,
    ) -> Result<Vec<ConnectionStream>> {
        let mut chunks = Vec::new();
        if stream.bytes.is_empty() {
            return Ok(chunks);
        }

        let max = self.config.max_chunk_bytes.max(1);
        let total = stream.bytes.len();

        let mut document_index = 0;
        let mut chunk_start = 0usize; // global offset of the open chunk
        let mut blocks_indexes: Vec<usize> = Vec::new();
        let mut blocks_timestamps = Vec::new();
        let mut blocks_loss = Vec::new();

        let mut close_chunk = |chunk_start: usize,
                               chunk_end: usize,
                               blocks_indexes: &mut Vec<usize>,
                               blocks_timestamps: &mut Vec<_>,
                               blocks_loss: &mut Vec<bool>,
                               document_index: &mut usize|
         -> Result<()> {
            let chunk = ConnectionStream {
                id: self.storage.next_row_id()?,
                connection_id,
                from_client,
                document_index: *document_index,
                payload: stream.bytes[chunk_start..chunk_end].to_vec(),
                blocks_indexes: std::mem::take(blocks_indexes),
                blocks_timestamps: std::mem::take(blocks_timestamps),
                blocks_loss: std::mem::take(blocks_loss),
                pattern_matches: matches_starting_in(matches, chunk_start as u64, chunk_end as u64),
                scanned_version,
            };
            if !chunk.check_invariants() {
                return Err(CaronteError::Internal(format!(
                    "chunk {} of connection {} violates block invariants",
                    chunk.document_index, connection_id
                )));
            }
            chunks.push(chunk);
            *document_index += 1;
            Ok(())
        };

        for (i, block) in stream.blocks.iter().enumerate() {
            let block_end = block_end(&stream.blocks, i, total);
            let mut pos = block.start;

            while pos < block_end {
                let used = pos - chunk_start;
                if used >= max {
                    close_chunk(
                        chunk_start,
                        pos,
                        &mut blocks_indexes,
                        &mut blocks_timestamps,
                        &mut blocks_loss,
                        &mut document_index,
                    )?;
                    chunk_start = pos;
                    continue;
                }

                let piece = (block_end - pos).min(max - used);
                blocks_indexes.push(pos - chunk_start);
                blocks_timestamps.push(block.timestamp);
                blocks_loss.push(block.loss);
                pos += piece;
            }
        }

        close_chunk(
            chunk_start,
            total,
            &mut blocks_indexes,
            &mut blocks_timestamps,
            &mut blocks_loss,
            &mut document_index,
        )?;

        Ok(chunks)
    }

    fn write_chunk(&self, chunk: &ConnectionStream) -> Result<()> {
        let mut delay = self.config.retry_base_delay;
        let mut last_error = None;

        for attempt in 0..self.config.retry_attempts {
            match self.storage.insert_stream_chunk(chunk) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    debug!(
                        attempt,
                        error = %e,
                        "stream chunk write failed, backing off"
                    );
                    last_error = Some(e);
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CaronteError::Transient("stream chunk write failed".into())
        }))
    }
}

fn block_end(blocks: &[BlockMeta], index: usize, total: usize) -> usize {
    blocks.get(index + 1).map(|b| b.start).unwrap_or(total)
}

/// The slices whose start offset falls inside `[from, to)`, per pattern.
pub(crate) fn matches_starting_in(
    matches: &HashMap<u64, Vec<PatternSlice>>,
    from: u64,
    to: u64,
) -> HashMap<u64, Vec<PatternSlice>> {
    let mut out = HashMap::new();
    for (&pattern_id, slices) in matches {
        let own: Vec<PatternSlice> = slices
            .iter()
            .filter(|(start, _)| *start >= from && *start < to)
            .copied()
            .collect();
        if !own.is_empty() {
            out.insert(pattern_id, own);
        }
    }
    out
}
