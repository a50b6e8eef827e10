//! Shared application state

use std::sync::Arc;

use crate::capture::SessionManager;
use crate::config::Config;
use crate::rescan::RescanHandle;
use crate::rules::RuleRegistry;
use crate::storage::Storage;
use crate::streams::StreamReader;

pub struct AppState {
    pub config: Config,
    pub storage: Storage,
    pub registry: Arc<RuleRegistry>,
    pub sessions: Arc<SessionManager>,
    pub reader: StreamReader,
    pub rescan: RescanHandle,
}

impl AppState {
    /// Queue a full re-scan after a rule mutation, when the policy asks
    /// for it and the database version actually moved.
    pub fn maybe_rescan(&self, before: u64) {
        use crate::config::RescanPolicy;

        let (_, after) = self.registry.current_database();
        if after > before && self.config.analysis.rescan_policy == RescanPolicy::Eager {
            if let Err(e) = self.rescan.enqueue_all(after) {
                tracing::error!(error = %e, "failed to queue re-scan");
            }
        }
    }
}
