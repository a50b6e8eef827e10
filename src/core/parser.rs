//! Raw frame parsing
//!
//! Turns captured link-layer bytes into the TCP `Packet` the assembler
//! consumes. Non-IP and non-TCP frames are rejected here; the session
//! counters treat a rejection as an invalid packet.

use chrono::{DateTime, Utc};
use etherparse::SlicedPacket;

use super::packet::{Packet, TcpFlags};

/// Parse a raw ethernet frame into a TCP packet.
///
/// Returns None for anything that is not IP-over-ethernet carrying TCP
/// (ARP, UDP, ICMP, truncated frames).
pub fn parse_packet(data: &[u8], timestamp: DateTime<Utc>) -> Option<Packet> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;
    packet_from_sliced(&sliced, timestamp)
}

/// Parse a raw IP packet (no ethernet header), for captures with
/// LINKTYPE_RAW link layers.
pub fn parse_ip_packet(data: &[u8], timestamp: DateTime<Utc>) -> Option<Packet> {
    if data.is_empty() {
        return None;
    }

    let version = (data[0] >> 4) & 0x0f;
    if version != 4 && version != 6 {
        return None;
    }

    let sliced = SlicedPacket::from_ip(data).ok()?;
    packet_from_sliced(&sliced, timestamp)
}

fn packet_from_sliced(sliced: &SlicedPacket<'_>, timestamp: DateTime<Utc>) -> Option<Packet> {
    let (src_ip, dst_ip) = match &sliced.net {
        Some(etherparse::NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                std::net::IpAddr::from(header.source_addr()),
                std::net::IpAddr::from(header.destination_addr()),
            )
        }
        Some(etherparse::NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                std::net::IpAddr::from(header.source_addr()),
                std::net::IpAddr::from(header.destination_addr()),
            )
        }
        _ => return None, // ARP, etc.
    };

    match &sliced.transport {
        Some(etherparse::TransportSlice::Tcp(tcp)) => Some(Packet {
            timestamp,
            src_ip,
            dst_ip,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            flags: TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
            },
            payload: tcp.payload().to_vec(),
        }),
        _ => None,
    }
}
