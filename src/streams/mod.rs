//! Serving reassembled streams
//!
//! The reader merges the two persisted halves of a connection back into an
//! ordered payload sequence; the format module decodes payload bytes for
//! display.

pub mod format;
pub mod reader;

pub use reader::{Payload, QueryFormat, RegexSlice, StreamReader};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation handle for store-facing reads
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
