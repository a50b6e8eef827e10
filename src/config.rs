use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
///
/// Read once at startup; immutable afterwards. The analysis knobs mirror the
/// fields written by `POST /setup` into the settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/caronte/config.toml"),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.general.db_path)
    }

    /// Get the directory where original captures are kept
    pub fn captures_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.captures_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path to SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Directory holding original uploaded/processed captures
    #[serde(default = "default_captures_dir")]
    pub captures_dir: String,

    /// Address the HTTP API binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            captures_dir: default_captures_dir(),
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
        }
    }
}

/// Knobs of the capture-to-connection pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Address of the defended service host
    #[serde(default)]
    pub server_address: Option<String>,

    /// Flag regex seeded as the initial rule (>= 8 chars)
    #[serde(default)]
    pub flag_regex: Option<String>,

    /// Wall-clock gap that starts a new block within a half-stream
    #[serde(default = "default_block_gap_ms")]
    pub block_gap_ms: u64,

    /// Idle seconds after which an open flow is terminated
    #[serde(default = "default_idle_flow_s")]
    pub idle_flow_s: u64,

    /// Maximum payload bytes per persisted stream chunk
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,

    /// Default byte limit for stream reads when the query omits one
    #[serde(default = "default_query_limit")]
    pub default_query_limit: u64,

    /// Floor for the scanner's sliding overlap window
    #[serde(default = "default_scan_overlap_bytes")]
    pub scan_overlap_bytes: usize,

    /// What to do with existing connections when the rule set changes
    #[serde(default)]
    pub rescan_policy: RescanPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            server_address: None,
            flag_regex: None,
            block_gap_ms: default_block_gap_ms(),
            idle_flow_s: default_idle_flow_s(),
            max_chunk_bytes: default_max_chunk_bytes(),
            default_query_limit: default_query_limit(),
            scan_overlap_bytes: default_scan_overlap_bytes(),
            rescan_policy: RescanPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RescanPolicy {
    /// Old connections keep matches from the version they were scanned against
    Off,
    /// Every rule-set version bump re-queues all existing connections
    #[default]
    Eager,
    /// History is left alone until an operator triggers a re-scan pass
    OnDemand,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require authentication on the API
    #[serde(default)]
    pub required: bool,

    /// username -> password
    #[serde(default)]
    pub accounts: HashMap<String, String>,
}

// Default value functions
fn default_db_path() -> String {
    "caronte.db".to_string()
}

fn default_captures_dir() -> String {
    "captures".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:3333".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_block_gap_ms() -> u64 {
    100
}

fn default_idle_flow_s() -> u64 {
    300
}

fn default_max_chunk_bytes() -> usize {
    64 * 1024
}

fn default_query_limit() -> u64 {
    8024
}

fn default_scan_overlap_bytes() -> usize {
    4096
}
