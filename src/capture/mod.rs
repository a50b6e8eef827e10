//! PCAP ingestion
//!
//! Session lifecycle (upload, local file, live interface) and the packet
//! feed that drives the assembler. Original captures are kept on disk so a
//! session can be downloaded back byte-identical.

pub mod feed;
pub mod session;

pub use feed::{validate_magic, FeedStats};
pub use session::SessionManager;
