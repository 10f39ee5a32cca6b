//! The in-memory replication graph.
//!
//! A uuid → datablock map shared between the session task (sole writer)
//! and the host application thread (reader). The server holds the
//! authoritative graph; every client holds a mirror.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::datablock::{Datablock, NodeState};
use crate::protocol::DatablockFrame;

/// Graph handle shared across threads.
pub type SharedGraph = Arc<RwLock<ReplicationGraph>>;

/// Create an empty shared graph.
pub fn shared_graph() -> SharedGraph {
    Arc::new(RwLock::new(ReplicationGraph::new()))
}

#[derive(Default)]
pub struct ReplicationGraph {
    nodes: HashMap<String, Datablock>,
}

impl ReplicationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Datablock) {
        self.nodes.insert(node.uuid.clone(), node);
    }

    pub fn get(&self, uuid: &str) -> Option<&Datablock> {
        self.nodes.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut Datablock> {
        self.nodes.get_mut(uuid)
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.nodes.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The full uuid catalog, in map order.
    pub fn uuids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Datablock)> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Datablock)> {
        self.nodes.iter_mut()
    }

    /// Uuids of every node owned by the given principal.
    pub fn owned_by(&self, owner: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.owner == owner)
            .map(|n| n.uuid.clone())
            .collect()
    }

    /// Remove a node and strip its uuid from every other node's
    /// dependency list in the same operation, so no dependent is left
    /// pointing at a disposed node.
    pub fn remove(&mut self, uuid: &str) -> Option<Datablock> {
        let removed = self.nodes.remove(uuid);
        if removed.is_some() {
            for node in self.nodes.values_mut() {
                node.dependencies.retain(|dep| dep != uuid);
            }
        }
        removed
    }

    /// Reassign ownership of a node. Returns false for an unknown uuid.
    pub fn change_owner(&mut self, uuid: &str, new_owner: &str) -> bool {
        match self.nodes.get_mut(uuid) {
            Some(node) => {
                node.owner = new_owner.to_string();
                true
            }
            None => false,
        }
    }

    /// Store a received frame: update the existing node in place (its
    /// live instance survives) or insert a fresh `Fetched` node.
    pub fn store(&mut self, frame: DatablockFrame) -> &mut Datablock {
        match self.nodes.entry(frame.uuid.clone()) {
            Entry::Occupied(entry) => {
                let node = entry.into_mut();
                node.owner = frame.owner;
                node.type_name = frame.type_name;
                node.dependencies = frame.dependencies;
                node.buffer = Some(frame.payload);
                node.sender = frame.sender;
                node.state = NodeState::Fetched;
                node
            }
            Entry::Vacant(entry) => entry.insert(Datablock::from_wire(
                frame.uuid,
                frame.owner,
                frame.type_name,
                frame.dependencies,
                frame.payload,
                frame.sender,
            )),
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn wire_node(uuid: &str, owner: &str, deps: Vec<String>) -> Datablock {
        Datablock::from_wire(
            uuid.to_string(),
            owner.to_string(),
            "bytes".to_string(),
            deps,
            Bytes::from_static(b"payload"),
            None,
        )
    }

    #[test]
    fn test_remove_strips_dependencies() {
        let mut graph = ReplicationGraph::new();
        graph.insert(wire_node("a", "alice", vec![]));
        graph.insert(wire_node("b", "alice", vec!["a".to_string()]));
        graph.insert(wire_node("c", "bob", vec!["a".to_string(), "b".to_string()]));

        assert!(graph.remove("a").is_some());
        assert!(!graph.contains("a"));
        assert!(graph.get("b").unwrap().dependencies.is_empty());
        assert_eq!(graph.get("c").unwrap().dependencies, vec!["b".to_string()]);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut graph = ReplicationGraph::new();
        graph.insert(wire_node("a", "alice", vec![]));
        assert!(graph.remove("ghost").is_none());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_change_owner_applies_identically_on_copies() {
        // The same command applied to independent mirrors must converge.
        let mut copies: Vec<ReplicationGraph> = (0..3)
            .map(|_| {
                let mut g = ReplicationGraph::new();
                g.insert(wire_node("x", "alice", vec![]));
                g
            })
            .collect();

        for graph in &mut copies {
            assert!(graph.change_owner("x", "bob"));
        }
        for graph in &copies {
            assert_eq!(graph.get("x").unwrap().owner, "bob");
        }
    }

    #[test]
    fn test_store_updates_in_place() {
        let mut graph = ReplicationGraph::new();
        graph.insert(wire_node("x", "alice", vec![]));

        let frame = DatablockFrame {
            sender: None,
            uuid: "x".to_string(),
            owner: "bob".to_string(),
            type_name: "bytes".to_string(),
            dependencies: vec!["y".to_string()],
            payload: Bytes::from_static(b"v2"),
        };
        let node = graph.store(frame);
        assert_eq!(node.owner, "bob");
        assert_eq!(node.state, NodeState::Fetched);
        assert_eq!(node.buffer.as_deref(), Some(b"v2".as_ref()));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_owned_by() {
        let mut graph = ReplicationGraph::new();
        graph.insert(wire_node("a", "alice", vec![]));
        graph.insert(wire_node("b", "bob", vec![]));
        graph.insert(wire_node("c", "alice", vec![]));

        let mut owned = graph.owned_by("alice");
        owned.sort();
        assert_eq!(owned, vec!["a".to_string(), "c".to_string()]);
    }
}
