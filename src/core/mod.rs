//! Core packet representation and parsing

pub mod packet;
pub mod parser;

pub use packet::{FlowKey, Packet, TcpFlags};
pub use parser::parse_packet;
