//! Flow table and packet demultiplexer
//!
//! The table is sharded by a hash of the normalized 4-tuple: packets of one
//! flow always serialize on the same shard lock, packets of distinct flows
//! usually proceed in parallel. Terminated flows leave the table through the
//! completion channel toward the persister.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::packet::{FlowKey, Packet};
use crate::error::Result;
use crate::models::RowId;
use crate::storage::Storage;

use super::flow::Flow;
use super::stream::BlockMeta;
use super::AssemblyConfig;

/// Reassembled bytes and block metadata of one side of a finished flow
#[derive(Debug)]
pub struct FinishedStream {
    pub bytes: Vec<u8>,
    pub blocks: Vec<BlockMeta>,
}

/// A terminated flow on its way to the persister
#[derive(Debug)]
pub struct CompletedFlow {
    pub connection_id: RowId,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub service_port: u16,
    pub client: FinishedStream,
    pub server: FinishedStream,
}

impl CompletedFlow {
    fn from_flow(flow: Flow) -> Self {
        let (client_bytes, client_blocks) = flow.client.into_parts();
        let (server_bytes, server_blocks) = flow.server.into_parts();
        Self {
            connection_id: flow.id,
            client_ip: flow.client_ip,
            client_port: flow.client_port,
            server_ip: flow.server_ip,
            server_port: flow.server_port,
            service_port: flow.service_port,
            client: FinishedStream {
                bytes: client_bytes,
                blocks: client_blocks,
            },
            server: FinishedStream {
                bytes: server_bytes,
                blocks: server_blocks,
            },
        }
    }
}

/// Sharded flow table fed by the capture sessions
pub struct Assembler {
    shards: Vec<Mutex<HashMap<FlowKey, Flow>>>,
    config: AssemblyConfig,
    storage: Storage,
    completed_tx: mpsc::UnboundedSender<CompletedFlow>,
}

impl Assembler {
    pub fn new(
        config: AssemblyConfig,
        storage: Storage,
        completed_tx: mpsc::UnboundedSender<CompletedFlow>,
    ) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            config,
            storage,
            completed_tx,
        }
    }

    fn shard_of(&self, key: &FlowKey) -> &Mutex<HashMap<FlowKey, Flow>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Feed one TCP packet. Creates the flow on first sight and emits it on
    /// the completion channel once it terminates.
    pub fn handle_packet(&self, pkt: Packet) -> Result<()> {
        let key = pkt.flow_key();
        let shard = self.shard_of(&key);
        let mut flows = shard.lock();

        if !flows.contains_key(&key) {
            let id = self.storage.next_row_id()?;
            debug!(connection = %id, flow = %key, "new flow");
            flows.insert(key, Flow::new(id, &pkt, &self.config));
        }

        let flow = flows.get_mut(&key).expect("flow just inserted");
        flow.handle_packet(&pkt, &self.config);

        if flow.is_terminated() {
            let flow = flows.remove(&key).expect("terminated flow present");
            self.emit(flow);
        }

        Ok(())
    }

    /// Terminate flows with no packet on either side for the idle window.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        for shard in &self.shards {
            let mut flows = shard.lock();
            let idle_keys: Vec<FlowKey> = flows
                .iter()
                .filter(|(_, flow)| flow.is_idle(now, self.config.idle_flow))
                .map(|(key, _)| *key)
                .collect();

            for key in idle_keys {
                if let Some(flow) = flows.remove(&key) {
                    debug!(connection = %flow.id, "flow idle, terminating");
                    self.emit(flow);
                    swept += 1;
                }
            }
        }
        swept
    }

    /// Terminate every open flow, regardless of FIN or idle status.
    /// Used by flush-all sessions and by shutdown.
    pub fn flush_all(&self) -> usize {
        let mut flushed = 0;
        for shard in &self.shards {
            let mut flows = shard.lock();
            for (_, flow) in flows.drain() {
                self.emit(flow);
                flushed += 1;
            }
        }
        flushed
    }

    pub fn open_flows(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn emit(&self, flow: Flow) {
        if flow.client.is_empty() && flow.server.is_empty() {
            // Nothing was reassembled (bare handshake); no connection record
            return;
        }
        if self.completed_tx.send(CompletedFlow::from_flow(flow)).is_err() {
            warn!("persister channel closed, dropping completed flow");
        }
    }
}
