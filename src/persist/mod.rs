//! Persistence of terminated flows
//!
//! The persister chunks each half-stream into bounded documents and runs the
//! scanner over the side's full bytes; the finalizer then materializes the
//! connection record. Chunks are always written before the connection row, so
//! a reader that sees a connection sees all of its streams.

pub mod finalizer;
pub mod persister;

pub use persister::{Persister, PersisterConfig};
