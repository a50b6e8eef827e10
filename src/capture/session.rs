//! PCAP session manager
//!
//! One session per ingestion run. Uploaded and local-file captures are
//! copied under the captures directory keyed by session id, fed to the
//! assembler on a blocking worker, and their counters written back to the
//! store. `flush_all` terminates every open flow at session end; without it
//! open flows stay in memory for a later session to continue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::assembly::Assembler;
use crate::error::{CaronteError, Result};
use crate::models::{PcapSession, RowId, SessionSource};
use crate::storage::Storage;

use super::feed::{self, validate_magic};

pub struct SessionManager {
    storage: Storage,
    assembler: Arc<Assembler>,
    captures_dir: PathBuf,
    /// Stop flags of running interface sessions
    live_sessions: Mutex<HashMap<RowId, Arc<AtomicBool>>>,
}

impl SessionManager {
    pub fn new(storage: Storage, assembler: Arc<Assembler>, captures_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&captures_dir)?;
        Ok(Self {
            storage,
            assembler,
            captures_dir,
            live_sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Ingest an uploaded capture. Validates the magic, stores the original
    /// bytes, feeds every packet, then finalizes the session record.
    pub async fn upload_session(&self, bytes: Vec<u8>, flush_all: bool) -> Result<PcapSession> {
        if !validate_magic(&bytes) {
            return Err(CaronteError::InvalidInput(
                "uploaded file is not a pcap or pcapng capture".into(),
            ));
        }

        let id = self.storage.next_row_id()?;
        let path = self.capture_path(id);
        tokio::fs::write(&path, &bytes).await?;

        self.run_session(id, path, bytes.len() as u64, SessionSource::Upload, flush_all)
            .await
    }

    /// Ingest a capture already on the local filesystem.
    pub async fn file_session(
        &self,
        source_path: &str,
        flush_all: bool,
        delete_original: bool,
    ) -> Result<PcapSession> {
        let bytes = tokio::fs::read(source_path)
            .await
            .map_err(|e| CaronteError::InvalidInput(format!("cannot read {}: {}", source_path, e)))?;
        if !validate_magic(&bytes) {
            return Err(CaronteError::InvalidInput(format!(
                "{} is not a pcap or pcapng capture",
                source_path
            )));
        }

        let id = self.storage.next_row_id()?;
        let path = self.capture_path(id);
        let size = bytes.len() as u64;
        tokio::fs::write(&path, bytes).await?;

        let session = self
            .run_session(id, path, size, SessionSource::File, flush_all)
            .await?;

        if delete_original {
            if let Err(e) = tokio::fs::remove_file(source_path).await {
                warn!(path = source_path, error = %e, "failed to delete original capture");
            }
        }
        Ok(session)
    }

    /// Start a live capture on a network device. Runs until stopped.
    pub fn start_interface_session(
        self: Arc<Self>,
        device: String,
    ) -> Result<(RowId, mpsc::UnboundedReceiver<()>)> {
        let id = self.storage.next_row_id()?;
        let session = PcapSession {
            id,
            started_at: Utc::now(),
            completed_at: None,
            size: 0,
            processed_packets: 0,
            invalid_packets: 0,
            packets_per_service: HashMap::new(),
            source: SessionSource::Interface,
        };
        self.storage.insert_session(&session)?;

        let stop = Arc::new(AtomicBool::new(false));
        self.live_sessions.lock().insert(id, stop.clone());

        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let manager = self.clone();
        tokio::task::spawn_blocking(move || {
            info!(session = %id, %device, "live capture started");
            let result = feed::feed_live(&device, &manager.assembler, stop);
            let mut session = session;
            session.completed_at = Some(Utc::now());
            if let Ok(stats) = &result {
                session.processed_packets = stats.processed;
                session.invalid_packets = stats.invalid;
                session.packets_per_service = stats.packets_per_service.clone();
            }
            if let Err(e) = manager.storage.update_session(&session) {
                warn!(session = %id, error = %e, "failed to update live session");
            }
            manager.live_sessions.lock().remove(&id);
            info!(session = %id, "live capture finished");
            let _ = done_tx.send(());
        });

        Ok((id, done_rx))
    }

    /// Stop a running interface session.
    pub fn stop_interface_session(&self, id: RowId) -> Result<()> {
        match self.live_sessions.lock().get(&id) {
            Some(stop) => {
                stop.store(true, Ordering::Relaxed);
                Ok(())
            }
            None => Err(CaronteError::NotFound(format!("live session {}", id))),
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<PcapSession>> {
        self.storage.list_sessions()
    }

    /// The original capture, byte-identical to what was ingested.
    pub async fn download_session(&self, id: RowId) -> Result<Vec<u8>> {
        if self.storage.get_session(id)?.is_none() {
            return Err(CaronteError::NotFound(format!("session {}", id)));
        }
        tokio::fs::read(self.capture_path(id))
            .await
            .map_err(|_| CaronteError::NotFound(format!("capture of session {}", id)))
    }

    fn capture_path(&self, id: RowId) -> PathBuf {
        self.captures_dir.join(format!("{}.pcap", id))
    }

    async fn run_session(
        &self,
        id: RowId,
        path: PathBuf,
        size: u64,
        source: SessionSource,
        flush_all: bool,
    ) -> Result<PcapSession> {
        let mut session = PcapSession {
            id,
            started_at: Utc::now(),
            completed_at: None,
            size,
            processed_packets: 0,
            invalid_packets: 0,
            packets_per_service: HashMap::new(),
            source,
        };
        self.storage.insert_session(&session)?;

        let assembler = self.assembler.clone();
        let feed_path = path.clone();
        let stats = tokio::task::spawn_blocking(move || feed::feed_file(&feed_path, &assembler))
            .await
            .map_err(|e| CaronteError::Internal(format!("feed worker panicked: {}", e)))??;

        if flush_all {
            let flushed = self.assembler.flush_all();
            info!(session = %id, flushed, "flush_all terminated open flows");
        }

        session.processed_packets = stats.processed;
        session.invalid_packets = stats.invalid;
        session.packets_per_service = stats.packets_per_service;
        session.completed_at = Some(Utc::now());
        self.storage.update_session(&session)?;

        info!(
            session = %id,
            processed = session.processed_packets,
            invalid = session.invalid_packets,
            "capture session complete"
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::AssemblyConfig;
    use tokio::sync::mpsc as tokio_mpsc;

    fn make_manager(dir: &std::path::Path) -> (Arc<SessionManager>, tokio_mpsc::UnboundedReceiver<crate::assembly::CompletedFlow>) {
        let storage = Storage::open_memory().unwrap();
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let assembler = Arc::new(Assembler::new(
            AssemblyConfig::default(),
            storage.clone(),
            tx,
        ));
        let manager =
            Arc::new(SessionManager::new(storage, assembler, dir.to_path_buf()).unwrap());
        (manager, rx)
    }

    /// Minimal classic little-endian pcap with the given records
    fn make_pcap(records: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes()); // magic
        out.extend_from_slice(&2u16.to_le_bytes()); // major
        out.extend_from_slice(&4u16.to_le_bytes()); // minor
        out.extend_from_slice(&0u32.to_le_bytes()); // thiszone
        out.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        out.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        out.extend_from_slice(&1u32.to_le_bytes()); // linktype ethernet
        for (i, record) in records.iter().enumerate() {
            out.extend_from_slice(&(i as u32 + 1).to_le_bytes()); // ts sec
            out.extend_from_slice(&0u32.to_le_bytes()); // ts usec
            out.extend_from_slice(&(record.len() as u32).to_le_bytes());
            out.extend_from_slice(&(record.len() as u32).to_le_bytes());
            out.extend_from_slice(record);
        }
        out
    }

    #[tokio::test]
    async fn test_upload_rejects_non_pcap() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = make_manager(dir.path());

        let result = manager.upload_session(b"definitely not a pcap".to_vec(), false).await;
        assert!(matches!(result, Err(CaronteError::InvalidInput(_))));
        assert!(manager.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = make_manager(dir.path());

        let capture = make_pcap(&[]);
        let session = manager.upload_session(capture.clone(), false).await.unwrap();
        assert_eq!(session.size, capture.len() as u64);
        assert!(session.completed_at.is_some());

        let downloaded = manager.download_session(session.id).await.unwrap();
        assert_eq!(downloaded, capture);
    }

    #[tokio::test]
    async fn test_session_counters() {
        use crate::core::parser::tests::make_tcp_frame;

        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = make_manager(dir.path());

        let tcp = make_tcp_frame(43210, 8080, 1, 0x18, b"data");
        let mut arp = make_tcp_frame(1, 2, 0, 0x02, b"");
        arp[12] = 0x08;
        arp[13] = 0x06;

        let capture = make_pcap(&[&tcp, &tcp, &arp]);
        let session = manager.upload_session(capture, false).await.unwrap();

        assert_eq!(session.processed_packets, 2);
        assert_eq!(session.invalid_packets, 1);
        assert_eq!(session.packets_per_service.get(&8080), Some(&2));
    }

    #[tokio::test]
    async fn test_flush_all_finalizes_open_flow() {
        use crate::core::parser::tests::make_tcp_frame;

        let dir = tempfile::tempdir().unwrap();
        let (manager, mut rx) = make_manager(dir.path());

        // data but no FIN: the flow stays half open
        let tcp = make_tcp_frame(43210, 8080, 1, 0x18, b"half open");
        let capture = make_pcap(&[&tcp]);

        manager.upload_session(capture.clone(), false).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.assembler.open_flows(), 1);

        // the replayed segment is a pure retransmission; flush_all then
        // terminates the flow
        manager.upload_session(capture, true).await.unwrap();
        assert_eq!(manager.assembler.open_flows(), 0);
        let completed = rx.try_recv().unwrap();
        assert_eq!(completed.client.bytes, b"half open");
        assert!(completed.client.blocks[0].loss);
    }

    #[tokio::test]
    async fn test_download_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = make_manager(dir.path());
        let result = manager.download_session(RowId(999)).await;
        assert!(matches!(result, Err(CaronteError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_file_session_deletes_original() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = make_manager(dir.path());

        let source = dir.path().join("source.pcap");
        std::fs::write(&source, make_pcap(&[])).unwrap();

        let session = manager
            .file_session(source.to_str().unwrap(), false, true)
            .await
            .unwrap();
        assert!(!source.exists());
        // the stored copy still serves downloads
        assert!(manager.download_session(session.id).await.is_ok());
    }
}
