//! Blocksync Client Library
//!
//! The client side of a replication session:
//! - Session worker (auth, snapshot sync, steady-state exchange)
//! - Heartbeat worker
//! - Host-facing orchestrator

pub mod orchestrator;
pub mod session;
mod ttl;

pub use orchestrator::{ConnectionStatus, Session, SessionState};
pub use session::{ClientEvent, ClientState, ConnectOptions};
