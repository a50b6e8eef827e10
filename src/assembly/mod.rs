//! TCP flow reassembly
//!
//! Turns the packet feed into ordered, side-tagged byte streams with
//! per-block timestamps and retransmission flags, and hands terminated flows
//! to the persister.

pub mod assembler;
pub mod flow;
pub mod stream;

pub use assembler::{Assembler, CompletedFlow, FinishedStream};
pub use flow::Flow;
pub use stream::{BlockMeta, HalfStream};

use chrono::Duration;

use crate::config::AnalysisConfig;

/// Assembly knobs, derived from the analysis configuration
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Wall-clock gap that starts a new block
    pub block_gap: Duration,
    /// Idle time after which an open flow is terminated
    pub idle_flow: Duration,
    /// Out-of-order segments buffered per half-stream before dropping
    pub ooo_capacity: usize,
    /// Number of flow-table shards
    pub shards: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            block_gap: Duration::milliseconds(100),
            idle_flow: Duration::seconds(300),
            ooo_capacity: 512,
            shards: 16,
        }
    }
}

impl From<&AnalysisConfig> for AssemblyConfig {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            block_gap: Duration::milliseconds(config.block_gap_ms as i64),
            idle_flow: Duration::seconds(config.idle_flow_s as i64),
            ..Default::default()
        }
    }
}
