//! Caronte: network traffic analyzer for CTF defense
//!
//! Ingests packet captures, reassembles TCP flows, scans payloads against a
//! versioned rule set, and serves connections, streams and matches to the
//! analyst UI over HTTP/JSON.

pub mod assembly;
pub mod capture;
pub mod config;
pub mod core;
pub mod error;
pub mod models;
pub mod parsers;
pub mod persist;
pub mod rescan;
pub mod rules;
pub mod storage;
pub mod streams;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::info;

use assembly::{Assembler, AssemblyConfig};
use capture::SessionManager;
use config::Config;
use persist::{Persister, PersisterConfig};
use rescan::Rescanner;
use rules::RuleRegistry;
use storage::Storage;
use streams::StreamReader;
use web::AppState;

/// How often open flows are checked against the idle timeout
const IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Number of background re-scan workers
const RESCAN_WORKERS: usize = 2;

/// The assembled application: pipeline workers plus shared state.
pub struct Caronte {
    state: Arc<AppState>,
    assembler: Arc<Assembler>,
}

impl Caronte {
    /// Wire up storage, registry, assembler, persister and re-scan pool.
    /// Must run inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let storage = Storage::open(config.db_path())
            .with_context(|| format!("opening database {}", config.general.db_path))?;
        let registry = Arc::new(
            RuleRegistry::open(storage.clone()).context("loading rule registry")?,
        );

        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let assembler = Arc::new(Assembler::new(
            AssemblyConfig::from(&config.analysis),
            storage.clone(),
            completed_tx,
        ));

        let persister = Arc::new(Persister::new(
            storage.clone(),
            registry.clone(),
            PersisterConfig {
                max_chunk_bytes: config.analysis.max_chunk_bytes,
                scan_overlap_bytes: config.analysis.scan_overlap_bytes,
                ..Default::default()
            },
        ));
        tokio::spawn(persister.run(completed_rx));

        let rescan = Rescanner::spawn(
            storage.clone(),
            registry.clone(),
            config.analysis.scan_overlap_bytes,
            RESCAN_WORKERS,
        );

        let sessions = Arc::new(
            SessionManager::new(storage.clone(), assembler.clone(), config.captures_dir())
                .context("preparing captures directory")?,
        );

        let reader = StreamReader::with_default_limit(
            storage.clone(),
            config.analysis.default_query_limit,
        );

        bootstrap_settings(&config, &storage, &registry)?;

        // Wall-clock idle sweeper for live captures
        let sweeper = assembler.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_SWEEP_PERIOD);
            loop {
                interval.tick().await;
                sweeper.sweep_idle(Utc::now());
            }
        });

        let state = Arc::new(AppState {
            config,
            storage,
            registry,
            sessions,
            reader,
            rescan,
        });

        Ok(Self { state, assembler })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Serve the API until interrupted; shutdown forces every open flow
    /// through the persister.
    pub async fn serve(self) -> Result<()> {
        let addr = self.state.config.general.listen_addr.clone();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        info!(%addr, "caronte listening");

        let router = web::router(self.state.clone());
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            })
            .await
            .context("serving API")?;

        let flushed = self.assembler.flush_all();
        if flushed > 0 {
            info!(flushed, "open flows flushed on shutdown");
        }
        Ok(())
    }
}

/// Apply configuration-file bootstrap when the store was never set up:
/// write the settings document and seed the flag rule.
fn bootstrap_settings(
    config: &Config,
    storage: &Storage,
    registry: &Arc<RuleRegistry>,
) -> Result<()> {
    if storage.get_settings()?.is_some() {
        return Ok(());
    }
    let (Some(server_address), Some(flag_regex)) = (
        config.analysis.server_address.clone(),
        config.analysis.flag_regex.clone(),
    ) else {
        return Ok(());
    };

    storage.put_settings(&models::Settings {
        server_address,
        flag_regex: flag_regex.clone(),
        auth_required: config.auth.required,
        accounts: config.auth.accounts.clone(),
    })?;

    let seeded = registry.add_rule(rules::Rule {
        id: models::RowId::ZERO,
        name: "flag".into(),
        color: "#e53935".into(),
        notes: "seeded from configuration".into(),
        enabled: true,
        patterns: vec![rules::Pattern {
            regex: flag_regex,
            flags: rules::PatternFlags::default(),
        }],
        version: 0,
    });
    match seeded {
        Ok(id) => info!(rule = %id, "flag rule seeded from configuration"),
        Err(error::CaronteError::Conflict(_)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
