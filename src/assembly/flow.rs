//! Flow state
//!
//! One tracked TCP conversation: the normalized key, both half-stream
//! assemblers, and termination bookkeeping. The client is the sender of the
//! first observed packet; the service port is that packet's destination.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};

use crate::core::packet::{FlowKey, Packet};
use crate::models::RowId;

use super::stream::HalfStream;
use super::AssemblyConfig;

#[derive(Debug)]
pub struct Flow {
    /// Connection id, allocated at flow creation so finalization is
    /// idempotent per flow instance
    pub id: RowId,
    pub key: FlowKey,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    /// The listening side: destination port of the first packet
    pub service_port: u16,
    pub client: HalfStream,
    pub server: HalfStream,
    rst_seen: bool,
    pub last_activity: DateTime<Utc>,
}

impl Flow {
    /// Create a flow from its first observed packet.
    pub fn new(id: RowId, first: &Packet, config: &AssemblyConfig) -> Self {
        Self {
            id,
            key: first.flow_key(),
            client_ip: first.src_ip,
            client_port: first.src_port,
            server_ip: first.dst_ip,
            server_port: first.dst_port,
            service_port: first.dst_port,
            client: HalfStream::new(config.ooo_capacity),
            server: HalfStream::new(config.ooo_capacity),
            rst_seen: false,
            last_activity: first.timestamp,
        }
    }

    /// Whether a packet belongs to the client-to-server direction.
    pub fn from_client(&self, pkt: &Packet) -> bool {
        pkt.src_ip == self.client_ip && pkt.src_port == self.client_port
    }

    /// Feed a packet of this flow to the owning half-stream.
    pub fn handle_packet(&mut self, pkt: &Packet, config: &AssemblyConfig) {
        self.last_activity = pkt.timestamp;

        if pkt.flags.rst {
            self.rst_seen = true;
            return;
        }

        let from_client = self.from_client(pkt);
        let side = if from_client {
            &mut self.client
        } else {
            &mut self.server
        };

        if pkt.flags.syn {
            side.on_syn(pkt.seq);
            return;
        }

        side.on_segment(
            pkt.seq,
            &pkt.payload,
            pkt.flags.fin,
            pkt.timestamp,
            config.block_gap,
        );
    }

    /// Graceful or abortive termination.
    pub fn is_terminated(&self) -> bool {
        self.rst_seen || (self.client.fin_seen() && self.server.fin_seen())
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle: Duration) -> bool {
        now - self.last_activity > idle
    }

    pub fn total_bytes(&self) -> usize {
        self.client.len() + self.server.len()
    }
}
