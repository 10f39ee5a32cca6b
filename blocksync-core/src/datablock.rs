//! The versioned replication node and its state machine.
//!
//! Local lifecycle: `Added` → `Committed` (serialize the live instance) →
//! `Up` (pushed as the authoritative copy) → `Modified` (local edit
//! detected) → `Committed` → `Up`, looping. Remote copies arrive as
//! `Fetched` and move to `Up` once the payload is applied to a live
//! instance.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::bindings::{BindingRegistry, Instance};
use crate::error::{ReplicationError, Result};

/// Replication state of a single datablock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Created locally, live instance exists, never serialized.
    Added,
    /// Serialized and ready to push.
    Committed,
    /// Received from the network, not yet applied.
    Fetched,
    /// Local edit detected since the last commit.
    Modified,
    /// Authoritative copy: pushed, or applied after receipt.
    Up,
}

impl NodeState {
    /// A push is only legal from a serialized state.
    pub fn can_push(self) -> bool {
        matches!(self, NodeState::Committed | NodeState::Up)
    }

    /// Applying a payload to the live instance is only legal for remote
    /// copies or as a re-apply/reset of an up-to-date node.
    pub fn can_apply(self) -> bool {
        matches!(self, NodeState::Fetched | NodeState::Up)
    }

    /// Committing requires a live instance that is new or locally edited
    /// (re-committing an `Up` node is the no-change case).
    pub fn can_commit(self) -> bool {
        matches!(self, NodeState::Added | NodeState::Modified | NodeState::Up)
    }
}

/// The unit of replication: a named, owned, versioned node of the shared
/// graph.
pub struct Datablock {
    /// Globally unique identifier, immutable for the node's lifetime.
    pub uuid: String,
    /// Principal currently allowed to mutate this node.
    pub owner: String,
    /// Discriminator selecting the binding that reconstructs the payload.
    pub type_name: String,
    /// Serialized payload (post-commit).
    pub buffer: Option<Bytes>,
    /// Live in-process instance (pre-commit).
    pub instance: Option<Instance>,
    /// Uuids of other nodes this node's live instance relies on.
    pub dependencies: Vec<String>,
    pub state: NodeState,
    /// Socket identity that delivered the current copy. Transient; used
    /// for loop suppression and snapshot bookkeeping.
    pub sender: Option<Uuid>,
}

impl Datablock {
    /// Create a node from a live instance. The node starts `Added` with a
    /// fresh uuid.
    pub fn new(owner: impl Into<String>, type_name: impl Into<String>, instance: Instance) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            owner: owner.into(),
            type_name: type_name.into(),
            buffer: None,
            instance: Some(instance),
            dependencies: Vec::new(),
            state: NodeState::Added,
            sender: None,
        }
    }

    /// Rebuild a node from wire fields. The node starts `Fetched` with no
    /// live instance.
    pub fn from_wire(
        uuid: String,
        owner: String,
        type_name: String,
        dependencies: Vec<String>,
        buffer: Bytes,
        sender: Option<Uuid>,
    ) -> Self {
        Self {
            uuid,
            owner,
            type_name,
            buffer: Some(buffer),
            instance: None,
            dependencies,
            state: NodeState::Fetched,
            sender,
        }
    }

    /// Serialize the live instance into the committed buffer.
    ///
    /// Legal from `Added`, `Modified` or `Up`; anything else is a caller
    /// error.
    pub fn commit(&mut self, registry: &BindingRegistry) -> Result<()> {
        if !self.state.can_commit() {
            return Err(ReplicationError::State(format!(
                "cannot commit node {} from state {:?}",
                self.uuid, self.state
            )));
        }
        let instance = self.instance.as_ref().ok_or_else(|| {
            ReplicationError::State(format!("node {} has no live instance to commit", self.uuid))
        })?;
        let binding = registry.get(&self.type_name)?;
        if !binding.is_valid(instance) {
            return Err(ReplicationError::Data(format!(
                "live instance of node {} is no longer valid",
                self.uuid
            )));
        }
        self.buffer = Some(binding.dump(instance)?);
        self.state = NodeState::Committed;
        Ok(())
    }

    /// Apply the committed payload to the live instance, constructing one
    /// first if none exists.
    ///
    /// Legal from `Fetched` (first receipt) or `Up` (re-apply/reset). A
    /// load failure is retried once against a freshly constructed
    /// instance, then surfaced.
    pub fn apply(&mut self, registry: &BindingRegistry) -> Result<()> {
        if !self.state.can_apply() {
            return Err(ReplicationError::State(format!(
                "cannot apply node {} from state {:?}",
                self.uuid, self.state
            )));
        }
        let payload = self
            .buffer
            .clone()
            .ok_or_else(|| ReplicationError::Data(format!("node {} has no payload", self.uuid)))?;
        let binding = registry.get(&self.type_name)?;

        let mut instance = match self.instance.take() {
            Some(instance) => instance,
            None => binding.construct(&payload)?,
        };
        if let Err(err) = binding.load(&mut instance, &payload) {
            tracing::warn!(uuid = %self.uuid, "load failed, rebuilding instance: {err}");
            instance = binding.construct(&payload)?;
            binding.load(&mut instance, &payload)?;
        }
        self.instance = Some(instance);
        self.state = NodeState::Up;
        Ok(())
    }

    /// Re-serialize the live instance and structurally compare against the
    /// committed buffer. Polling design; callers decide the cadence.
    pub fn has_changed(&self, registry: &BindingRegistry) -> Result<bool> {
        let instance = match &self.instance {
            Some(instance) => instance,
            None => return Ok(false),
        };
        let buffer = match &self.buffer {
            Some(buffer) => buffer,
            None => return Ok(true),
        };
        let binding = registry.get(&self.type_name)?;
        Ok(binding.dump(instance)? != *buffer)
    }

    /// Flip an `Up` node to `Modified` when its live instance diverged
    /// from the committed payload. Returns whether the transition fired.
    pub fn poll_modified(&mut self, registry: &BindingRegistry) -> Result<bool> {
        if self.state == NodeState::Up && self.has_changed(registry)? {
            self.state = NodeState::Modified;
            return Ok(true);
        }
        Ok(false)
    }
}

impl fmt::Debug for Datablock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datablock")
            .field("uuid", &self.uuid)
            .field("owner", &self.owner)
            .field("type_name", &self.type_name)
            .field("state", &self.state)
            .field("dependencies", &self.dependencies)
            .field("buffer_len", &self.buffer.as_ref().map(Bytes::len))
            .field("has_instance", &self.instance.is_some())
            .finish()
    }
}
