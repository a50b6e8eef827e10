//! Packet feed
//!
//! Reads a capture file sequentially and feeds every TCP packet to the
//! assembler. Packet order within a capture is preserved: one feed runs on
//! one worker. Malformed packets are counted, never propagated.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use pcap::{Capture, Linktype};
use tracing::{debug, warn};

use crate::assembly::Assembler;
use crate::core::parser;
use crate::error::{CaronteError, Result};

/// Flows idle in capture time are swept this often, in packets
const IDLE_SWEEP_INTERVAL: u64 = 1024;

/// Counters of one feed run
#[derive(Debug, Default, Clone)]
pub struct FeedStats {
    /// TCP packets the assembler accepted
    pub processed: u64,
    /// Non-IP, non-TCP, or truncated packets
    pub invalid: u64,
    /// TCP destination port -> packet count
    pub packets_per_service: std::collections::HashMap<u16, u64>,
}

/// Check for the pcap / pcapng magic at the start of a capture.
pub fn validate_magic(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    matches!(
        [bytes[0], bytes[1], bytes[2], bytes[3]],
        // classic pcap, both endiannesses, micro and nanosecond variants
        [0xa1, 0xb2, 0xc3, 0xd4]
            | [0xd4, 0xc3, 0xb2, 0xa1]
            | [0xa1, 0xb2, 0x3c, 0x4d]
            | [0x4d, 0x3c, 0xb2, 0xa1]
            // pcapng section header block
            | [0x0a, 0x0d, 0x0d, 0x0a]
    )
}

/// Feed a capture file to the assembler until EOF.
pub fn feed_file(path: &Path, assembler: &Assembler) -> Result<FeedStats> {
    let capture = Capture::from_file(path)
        .map_err(|e| CaronteError::InvalidInput(format!("cannot open capture: {}", e)))?;
    feed_capture(capture, assembler, None)
}

/// Feed a live capture until the stop flag is raised.
pub fn feed_live(
    device: &str,
    assembler: &Assembler,
    stop: Arc<AtomicBool>,
) -> Result<FeedStats> {
    let capture = Capture::from_device(device)
        .map_err(|e| CaronteError::InvalidInput(format!("cannot open device {}: {}", device, e)))?
        .promisc(true)
        .snaplen(65535)
        .timeout(100)
        .open()
        .map_err(|e| CaronteError::InvalidInput(format!("cannot start capture: {}", e)))?;
    feed_capture(capture, assembler, Some(stop))
}

fn feed_capture<T: pcap::Activated>(
    mut capture: Capture<T>,
    assembler: &Assembler,
    stop: Option<Arc<AtomicBool>>,
) -> Result<FeedStats> {
    let linktype = capture.get_datalink();
    let mut stats = FeedStats::default();
    let mut last_timestamp: Option<DateTime<Utc>> = None;

    loop {
        if let Some(stop) = &stop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
        }

        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::NoMorePackets) => break,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                warn!(error = %e, "capture read failed");
                break;
            }
        };

        let timestamp = timeval_to_datetime(
            packet.header.ts.tv_sec as i64,
            packet.header.ts.tv_usec as i64,
        );

        let parsed = match linktype {
            Linktype::RAW => parser::parse_ip_packet(packet.data, timestamp),
            _ => parser::parse_packet(packet.data, timestamp),
        };

        match parsed {
            Some(pkt) => {
                *stats.packets_per_service.entry(pkt.dst_port).or_insert(0) += 1;
                assembler.handle_packet(pkt)?;
                stats.processed += 1;
            }
            None => {
                stats.invalid += 1;
            }
        }

        last_timestamp = Some(timestamp);
        if stats.processed > 0 && stats.processed % IDLE_SWEEP_INTERVAL == 0 {
            assembler.sweep_idle(timestamp);
        }
    }

    // Judge idle flows against capture time, not the wall clock
    if let Some(timestamp) = last_timestamp {
        let swept = assembler.sweep_idle(timestamp);
        if swept > 0 {
            debug!(swept, "flows idle at end of capture");
        }
    }

    Ok(stats)
}

fn timeval_to_datetime(sec: i64, usec: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(sec, (usec * 1000) as u32)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_validation() {
        assert!(validate_magic(&[0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00]));
        assert!(validate_magic(&[0xa1, 0xb2, 0xc3, 0xd4]));
        assert!(validate_magic(&[0x0a, 0x0d, 0x0d, 0x0a, 0x00]));
        assert!(!validate_magic(b"PK\x03\x04zipfile"));
        assert!(!validate_magic(b"\xd4\xc3"));
        assert!(!validate_magic(b""));
    }

    #[test]
    fn test_timeval_conversion() {
        let ts = timeval_to_datetime(1, 500_000);
        assert_eq!(ts.timestamp_millis(), 1_500);
    }
}
