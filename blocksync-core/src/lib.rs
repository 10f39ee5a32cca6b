//! Blocksync Core Library
//!
//! Core functionality for blocksync including:
//! - Datablock model and state machine
//! - In-memory replication graph
//! - Pluggable per-type data bindings
//! - Control command set
//! - Wire protocol codec (multipart framing, chunking)
//! - Session/server configuration

pub mod bindings;
pub mod command;
pub mod config;
pub mod datablock;
pub mod error;
pub mod graph;
pub mod protocol;

pub use bindings::{BindingRegistry, BytesBinding, DataBinding, Instance};
pub use command::{
    AUTH_FAILED_PREFIX, AUTH_LOBBY, AUTH_RUNNING, AuthRequest, AuthRole, ClientInfo, ClientStatus,
    Command, SeedNode, ServerSnapshotMsg, SessionSettings, SnapshotMsg,
};
pub use config::{COMMON_OWNER, PROTOCOL_VERSION, SERVER_OWNER, SessionConfig};
pub use datablock::{Datablock, NodeState};
pub use error::{ReplicationError, Result};
pub use graph::{ReplicationGraph, SharedGraph, shared_graph};
pub use protocol::{
    CommandFrame, DatablockFrame, MAX_CHUNK_SIZE, TTL_INIT, TTL_PING, chunk_count, chunk_payload,
    read_identity, read_parts, reassemble_chunks, send_command, send_datablock, write_identity,
    write_parts,
};
