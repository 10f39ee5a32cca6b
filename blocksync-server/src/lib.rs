//! Blocksync Server Library
//!
//! The authoritative side of a replication session:
//! - Server session (graph ownership, snapshot distribution, fan-out)
//! - Connected-client registry
//! - Heartbeat monitor

pub mod registry;
pub mod session;
pub mod ttl;

pub use registry::ClientRegistry;
pub use session::{ServerConfig, ServerHandle, listen};
pub use ttl::{TtlControl, TtlEvent};
