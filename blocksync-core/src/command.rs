//! Control commands exchanged over the command channel.
//!
//! Commands are small, stateless messages applied directly against the
//! graph or the session's own bookkeeping. Graph operations (`Delete`,
//! `ChangeOwner`) are broadcast by the server and applied identically on
//! every copy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::graph::ReplicationGraph;

/// Role requested during the auth handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthRole {
    /// Holder of the shared secret; may kick other clients.
    Admin,
    Client,
}

/// Auth handshake request, sent by a client immediately on connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub auth_type: AuthRole,
    /// Requested declared identity (user-visible name).
    pub auth_id: String,
    /// Shared secret; required for the admin role.
    pub password: Option<String>,
    /// Protocol version; must match the server exactly.
    pub version: String,
}

/// Auth reply status strings.
pub const AUTH_LOBBY: &str = "LOBBY";
pub const AUTH_RUNNING: &str = "RUNNING";
pub const AUTH_FAILED_PREFIX: &str = "FAILED:";

/// Snapshot synchronization messages (late-joiner catalog sync).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotMsg {
    /// Client asks for the full uuid catalog.
    RequestInit,
    /// Server replies with the ordered catalog of uuids to fetch.
    Init { catalog: Vec<String> },
    /// Client requests one node; the reply arrives on the subscription
    /// socket.
    Get { id: String },
    /// Client announces it is fully synchronized.
    Done,
}

/// One node as carried by the server-seed handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedNode {
    pub uuid: String,
    pub owner: String,
    pub type_name: String,
    pub dependencies: Vec<String>,
    pub data: Vec<u8>,
}

/// Server-seed handshake: the very first client populates the server's
/// empty graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerSnapshotMsg {
    /// Client announces the uuids it is about to stream.
    Init { nodes: Vec<String> },
    Accepted,
    Rejected,
    /// One node of the seed.
    Set { node: SeedNode },
    /// Client finished streaming.
    End,
    /// Server confirms the seed is complete.
    Done,
}

/// Connection status of a registered client, as shown in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    Lobby,
    Syncing,
    Active,
}

/// Roster entry for one connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub admin: bool,
    pub latency_ms: u64,
    pub status: ClientStatus,
    pub metadata: HashMap<String, String>,
    /// Unix timestamp of registration.
    pub connected_since: i64,
}

/// Settings the server advertises to every client after auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub ping_interval_ms: u64,
    pub timeout_ms: u64,
}

/// The command tagged union. Every wire command frame carries one of
/// these plus the owner principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Auth(AuthRequest),
    /// Bare status string: "LOBBY", "RUNNING" or "FAILED:<reason>".
    AuthStatus(String),
    Config(SessionSettings),
    Snapshot(SnapshotMsg),
    ServerSnapshot(ServerSnapshotMsg),
    Delete {
        uuid: String,
    },
    ChangeOwner {
        uuid: String,
        new_owner: String,
    },
    Disconnect {
        reason: String,
    },
    Kick {
        user: String,
    },
    ClientsState(HashMap<String, ClientInfo>),
    UserMetadata(HashMap<String, String>),
}

impl Command {
    /// Wire discriminator, carried as its own frame part.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Auth(_) => "Auth",
            Command::AuthStatus(_) => "AuthStatus",
            Command::Config(_) => "Config",
            Command::Snapshot(_) => "Snapshot",
            Command::ServerSnapshot(_) => "ServerSnapshot",
            Command::Delete { .. } => "Delete",
            Command::ChangeOwner { .. } => "ChangeOwner",
            Command::Disconnect { .. } => "Disconnect",
            Command::Kick { .. } => "Kick",
            Command::ClientsState(_) => "ClientsState",
            Command::UserMetadata(_) => "UserMetadata",
        }
    }

    /// Whether this command mutates the graph when received.
    pub fn is_graph_op(&self) -> bool {
        matches!(self, Command::Delete { .. } | Command::ChangeOwner { .. })
    }

    /// Apply a graph operation. Returns whether the graph changed; other
    /// command kinds are no-ops here.
    pub fn execute(&self, graph: &mut ReplicationGraph) -> bool {
        match self {
            Command::Delete { uuid } => graph.remove(uuid).is_some(),
            Command::ChangeOwner { uuid, new_owner } => graph.change_owner(uuid, new_owner),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datablock::Datablock;
    use bytes::Bytes;

    fn graph_with(uuids: &[&str]) -> ReplicationGraph {
        let mut graph = ReplicationGraph::new();
        for uuid in uuids {
            graph.insert(Datablock::from_wire(
                uuid.to_string(),
                "alice".to_string(),
                "bytes".to_string(),
                vec![],
                Bytes::from_static(b"payload"),
                None,
            ));
        }
        graph
    }

    #[test]
    fn test_delete_executes_against_graph() {
        let mut graph = graph_with(&["a", "b"]);
        let cmd = Command::Delete {
            uuid: "a".to_string(),
        };
        assert!(cmd.is_graph_op());
        assert!(cmd.execute(&mut graph));
        assert!(!graph.contains("a"));
        // Deleting again is a clean no-op.
        assert!(!cmd.execute(&mut graph));
    }

    #[test]
    fn test_change_owner_executes_against_graph() {
        let mut graph = graph_with(&["a"]);
        let cmd = Command::ChangeOwner {
            uuid: "a".to_string(),
            new_owner: "bob".to_string(),
        };
        assert!(cmd.execute(&mut graph));
        assert_eq!(graph.get("a").unwrap().owner, "bob");
    }

    #[test]
    fn test_non_graph_commands_do_not_touch_graph() {
        let mut graph = graph_with(&["a"]);
        let cmd = Command::Disconnect {
            reason: "kicked by admin".to_string(),
        };
        assert!(!cmd.is_graph_op());
        assert!(!cmd.execute(&mut graph));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_command_bincode_roundtrip() {
        let cmd = Command::Auth(AuthRequest {
            auth_type: AuthRole::Admin,
            auth_id: "alice".to_string(),
            password: Some("secret".to_string()),
            version: "0.1.0".to_string(),
        });
        let encoded = bincode::serialize(&cmd).unwrap();
        let decoded: Command = bincode::deserialize(&encoded).unwrap();
        match decoded {
            Command::Auth(req) => {
                assert_eq!(req.auth_id, "alice");
                assert_eq!(req.auth_type, AuthRole::Admin);
            }
            other => panic!("expected Auth, got {other:?}"),
        }
        assert_eq!(cmd.tag(), "Auth");
    }
}
