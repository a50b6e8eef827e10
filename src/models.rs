//! Persisted data model
//!
//! Row types for the `connections`, `connection_streams`, `pcap_sessions`,
//! `services` and `settings` collections. Rule types live in `rules`.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Globally ordered opaque row identifier. Zero means "unset".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RowId(pub i64);

impl RowId {
    pub const ZERO: RowId = RowId(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte range of one pattern occurrence, in flow-global offsets of one side.
pub type PatternSlice = (u64, u64);

/// One persisted chunk of one side of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStream {
    pub id: RowId,
    pub connection_id: RowId,
    pub from_client: bool,
    pub document_index: usize,
    #[serde(with = "crate::streams::format::base64_bytes")]
    pub payload: Vec<u8>,
    /// Byte offset within `payload` where each block begins; strictly increasing
    pub blocks_indexes: Vec<usize>,
    /// Capture time of the first packet of each block
    pub blocks_timestamps: Vec<DateTime<Utc>>,
    /// Whether a retransmitted segment contributed bytes to each block
    pub blocks_loss: Vec<bool>,
    /// pattern-id -> occurrences, flow-global offsets, ascending per pattern
    pub pattern_matches: HashMap<u64, Vec<PatternSlice>>,
    /// Rule database version the matches were produced against
    pub scanned_version: u64,
}

impl ConnectionStream {
    /// Validate the block-array invariants of a persisted chunk.
    pub fn check_invariants(&self) -> bool {
        if self.blocks_indexes.len() != self.blocks_timestamps.len()
            || self.blocks_indexes.len() != self.blocks_loss.len()
        {
            return false;
        }
        if self.payload.is_empty() {
            return self.blocks_indexes.is_empty();
        }
        if self.blocks_indexes.is_empty() {
            return false;
        }
        let increasing = self
            .blocks_indexes
            .windows(2)
            .all(|w| w[0] < w[1]);
        increasing && *self.blocks_indexes.last().unwrap() < self.payload.len()
    }
}

/// One finalized TCP flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: RowId,
    pub ip_src: IpAddr,
    pub port_src: u16,
    pub ip_dst: IpAddr,
    pub port_dst: u16,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub client_documents: usize,
    pub server_documents: usize,
    pub processed_at: DateTime<Utc>,
    pub matched_rules: Vec<RowId>,
    /// The listening side of the flow (the SYN's destination port)
    pub service_port: u16,
    pub marked: bool,
    pub hidden: bool,
}

impl Connection {
    pub fn duration_ms(&self) -> i64 {
        (self.closed_at - self.started_at).num_milliseconds()
    }

    pub fn total_bytes(&self) -> u64 {
        self.client_bytes + self.server_bytes
    }
}

/// How a capture session was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Upload,
    File,
    Interface,
}

impl std::fmt::Display for SessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionSource::Upload => write!(f, "upload"),
            SessionSource::File => write!(f, "file"),
            SessionSource::Interface => write!(f, "interface"),
        }
    }
}

impl std::str::FromStr for SessionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(SessionSource::Upload),
            "file" => Ok(SessionSource::File),
            "interface" => Ok(SessionSource::Interface),
            other => Err(format!("unknown session source: {}", other)),
        }
    }
}

/// One pcap ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcapSession {
    pub id: RowId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Size in bytes of the original capture
    pub size: u64,
    pub processed_packets: u64,
    pub invalid_packets: u64,
    /// TCP destination port -> packet count
    pub packets_per_service: HashMap<u16, u64>,
    pub source: SessionSource,
}

/// Analyst-facing label for a service port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub port: u16,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub notes: String,
}

/// Bootstrap settings written by `POST /setup`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub server_address: String,
    pub flag_regex: String,
    pub auth_required: bool,
    #[serde(default)]
    pub accounts: HashMap<String, String>,
}
