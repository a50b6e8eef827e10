//! TCP packet representation
//!
//! Carries the fields the assembler needs: 4-tuple, sequence number, flags,
//! payload, and the capture timestamp from the pcap record header.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }

    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Flow identity: the TCP 4-tuple, normalized so both directions of a
/// conversation map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub ip_a: IpAddr,
    pub port_a: u16,
    pub ip_b: IpAddr,
    pub port_b: u16,
}

impl FlowKey {
    /// Build the normalized key for a packet.
    pub fn from_packet(pkt: &Packet) -> Self {
        if (pkt.src_ip, pkt.src_port) <= (pkt.dst_ip, pkt.dst_port) {
            Self {
                ip_a: pkt.src_ip,
                port_a: pkt.src_port,
                ip_b: pkt.dst_ip,
                port_b: pkt.dst_port,
            }
        } else {
            Self {
                ip_a: pkt.dst_ip,
                port_a: pkt.dst_port,
                ip_b: pkt.src_ip,
                port_b: pkt.src_port,
            }
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.ip_a, self.port_a, self.ip_b, self.port_b
        )
    }
}

/// A parsed TCP packet as fed to the assembler
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp from the pcap record header
    pub timestamp: DateTime<Utc>,
    /// Source IP address
    pub src_ip: IpAddr,
    /// Destination IP address
    pub dst_ip: IpAddr,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// TCP sequence number
    pub seq: u32,
    /// TCP acknowledgment number
    pub ack: u32,
    /// TCP flags
    pub flags: TcpFlags,
    /// Segment payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Normalized flow key for this packet
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::from_packet(self)
    }
}
