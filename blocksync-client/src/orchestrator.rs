//! Host-facing session orchestrator.
//!
//! Sequences service startup (heartbeat worker, then session worker),
//! folds the workers' low-level events into one connection status the
//! host application polls, fails the launch when it exceeds the timeout,
//! and owns the teardown path: every shutdown stops the workers, clears
//! the graph mirror and outgoing queue, and returns to `Initial` only
//! once both workers have actually exited.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use blocksync_core::bindings::{BindingRegistry, Instance};
use blocksync_core::command::{ClientInfo, SessionSettings};
use blocksync_core::config::SessionConfig;
use blocksync_core::datablock::Datablock;
use blocksync_core::error::{ReplicationError, Result};
use blocksync_core::graph::{SharedGraph, shared_graph};

use crate::session::{ClientEvent, ClientState, ConnectOptions, HostCommand, run_client_session};
use crate::ttl::run_client_ttl;

/// Top-level orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    LaunchingServices,
    Active,
    Quitting,
}

/// The single connection-state value the host polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Launching,
    Lobby,
    Syncing { current: usize, total: usize },
    Connected,
    Refused { reason: String },
    Failed { reason: String },
    Disconnected { reason: String },
}

/// A replication session from the host application's point of view.
pub struct Session {
    config: SessionConfig,
    registry: Arc<BindingRegistry>,
    graph: SharedGraph,
    identity: Uuid,
    user_id: Option<String>,
    state: Arc<Mutex<SessionState>>,
    status: Arc<RwLock<ConnectionStatus>>,
    clients: Arc<RwLock<HashMap<String, ClientInfo>>>,
    settings: Arc<RwLock<Option<SessionSettings>>>,
    outgoing_tx: Option<mpsc::UnboundedSender<String>>,
    host_tx: Option<mpsc::UnboundedSender<HostCommand>>,
    stop_tx: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
    shutdown_reason: Arc<Mutex<Option<String>>>,
}

impl Session {
    /// Create an idle session. The binding registry is fixed for the
    /// session's lifetime; the transport identity is random and stable
    /// across reconnects of this instance.
    pub fn new(config: SessionConfig, registry: Arc<BindingRegistry>) -> Self {
        Self {
            config,
            registry,
            graph: shared_graph(),
            identity: Uuid::new_v4(),
            user_id: None,
            state: Arc::new(Mutex::new(SessionState::Initial)),
            status: Arc::new(RwLock::new(ConnectionStatus::Idle)),
            clients: Arc::new(RwLock::new(HashMap::new())),
            settings: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            host_tx: None,
            stop_tx: None,
            supervisor: None,
            shutdown_reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch the services and start connecting.
    pub async fn connect(&mut self, options: ConnectOptions) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Initial {
                return Err(ReplicationError::State(
                    "session is already started".to_string(),
                ));
            }
            *state = SessionState::LaunchingServices;
        }
        // Reap the previous run, if any; it has already wound down.
        if let Some(old) = self.supervisor.take() {
            let _ = old.await;
        }
        *self.status.write() = ConnectionStatus::Launching;
        self.clients.write().clear();
        *self.settings.write() = None;
        self.user_id = Some(options.id.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (svc_stop_tx, svc_stop_rx) = watch::channel(false);
        let (host_stop_tx, host_stop_rx) = watch::channel(false);
        self.outgoing_tx = Some(outgoing_tx);
        self.host_tx = Some(host_tx);
        self.stop_tx = Some(host_stop_tx);

        // Heartbeat monitor first, then the session worker.
        let ttl_handle = tokio::spawn(run_client_ttl(
            self.config.clone(),
            self.identity,
            events_tx.clone(),
            svc_stop_rx.clone(),
        ));
        let session_handle = tokio::spawn(run_client_session(
            self.config.clone(),
            self.identity,
            options,
            self.graph.clone(),
            self.registry.clone(),
            outgoing_rx,
            host_rx,
            events_tx,
            svc_stop_rx,
        ));

        let ctx = SupervisorCtx {
            events_rx,
            host_stop_rx,
            svc_stop_tx,
            ttl_handle,
            session_handle,
            graph: self.graph.clone(),
            state: self.state.clone(),
            status: self.status.clone(),
            clients: self.clients.clone(),
            settings: self.settings.clone(),
            shutdown_reason: self.shutdown_reason.clone(),
            launch_timeout: Duration::from_millis(self.config.connection_timeout_ms),
        };
        self.supervisor = Some(tokio::spawn(supervise(ctx)));
        Ok(())
    }

    /// Stop every service, clear local replication state, and wait until
    /// everything has exited.
    pub async fn shutdown(&mut self, reason: &str) {
        *self.shutdown_reason.lock() = Some(reason.to_string());
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(true);
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.await;
        }
        self.outgoing_tx = None;
        self.host_tx = None;
        self.user_id = None;
    }

    /// The local graph mirror.
    pub fn graph(&self) -> SharedGraph {
        self.graph.clone()
    }

    /// The stable transport identity of this session.
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Declared id used for the current connection, if any.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    /// Roster of connected peers, as last broadcast by the server.
    pub fn clients(&self) -> HashMap<String, ClientInfo> {
        self.clients.read().clone()
    }

    /// Settings the server advertised after auth.
    pub fn server_settings(&self) -> Option<SessionSettings> {
        self.settings.read().clone()
    }

    /// Create a node from a live instance and insert it into the local
    /// graph. Returns the new uuid.
    pub fn add_node(
        &self,
        owner: impl Into<String>,
        type_name: impl Into<String>,
        instance: Instance,
    ) -> String {
        let node = Datablock::new(owner, type_name, instance);
        let uuid = node.uuid.clone();
        self.graph.write().insert(node);
        uuid
    }

    /// Serialize a node's live instance, readying it for a push.
    pub fn commit(&self, uuid: &str) -> Result<()> {
        let mut graph = self.graph.write();
        let node = graph.get_mut(uuid).ok_or_else(|| {
            ReplicationError::State(format!("node {uuid} is not in the graph"))
        })?;
        node.commit(&self.registry)
    }

    /// Queue a committed node for the session worker to push.
    pub fn push(&self, uuid: &str) -> Result<()> {
        {
            let graph = self.graph.read();
            let node = graph.get(uuid).ok_or_else(|| {
                ReplicationError::State(format!("node {uuid} is not in the graph"))
            })?;
            if !node.state.can_push() {
                return Err(ReplicationError::State(format!(
                    "cannot push node {uuid} from state {:?}",
                    node.state
                )));
            }
        }
        let tx = self.outgoing_tx.as_ref().ok_or_else(|| {
            ReplicationError::State("session is not connected".to_string())
        })?;
        tx.send(uuid.to_string())
            .map_err(|_| ReplicationError::State("session worker has stopped".to_string()))
    }

    /// Diff every up-to-date node against its committed payload and flip
    /// changed ones to `Modified`. Returns the uuids that flipped. The
    /// caller decides how often to poll.
    pub fn poll_modified(&self) -> Vec<String> {
        let mut flipped = Vec::new();
        let mut graph = self.graph.write();
        for (uuid, node) in graph.iter_mut() {
            match node.poll_modified(&self.registry) {
                Ok(true) => flipped.push(uuid.clone()),
                Ok(false) => {}
                Err(err) => warn!("change detection failed for {uuid}: {err}"),
            }
        }
        flipped
    }

    /// Ask the server to kick a user (admin only).
    pub fn kick(&self, user: &str) -> Result<()> {
        self.send_host_command(HostCommand::Kick {
            user: user.to_string(),
        })
    }

    /// Merge metadata into this client's roster entry on the server.
    pub fn update_user_metadata(&self, metadata: HashMap<String, String>) -> Result<()> {
        self.send_host_command(HostCommand::UpdateMetadata(metadata))
    }

    fn send_host_command(&self, command: HostCommand) -> Result<()> {
        let tx = self.host_tx.as_ref().ok_or_else(|| {
            ReplicationError::State("session is not connected".to_string())
        })?;
        tx.send(command)
            .map_err(|_| ReplicationError::State("session worker has stopped".to_string()))
    }
}

struct SupervisorCtx {
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    host_stop_rx: watch::Receiver<bool>,
    svc_stop_tx: watch::Sender<bool>,
    ttl_handle: JoinHandle<()>,
    session_handle: JoinHandle<()>,
    graph: SharedGraph,
    state: Arc<Mutex<SessionState>>,
    status: Arc<RwLock<ConnectionStatus>>,
    clients: Arc<RwLock<HashMap<String, ClientInfo>>>,
    settings: Arc<RwLock<Option<SessionSettings>>>,
    shutdown_reason: Arc<Mutex<Option<String>>>,
    launch_timeout: Duration,
}

enum Step {
    Continue,
    Terminal,
}

async fn supervise(mut ctx: SupervisorCtx) {
    let deadline = tokio::time::Instant::now() + ctx.launch_timeout;
    let mut launching = true;
    loop {
        tokio::select! {
            _ = ctx.host_stop_rx.changed() => {
                let reason = ctx
                    .shutdown_reason
                    .lock()
                    .take()
                    .unwrap_or_else(|| "stopped by host".to_string());
                *ctx.status.write() = ConnectionStatus::Disconnected { reason };
                break;
            }

            maybe = ctx.events_rx.recv() => match maybe {
                Some(event) => {
                    if let Step::Terminal = apply_event(&ctx, event, &mut launching) {
                        break;
                    }
                }
                None => {
                    // Both workers died without a terminal event.
                    *ctx.status.write() = ConnectionStatus::Failed {
                        reason: "replication services terminated unexpectedly".to_string(),
                    };
                    break;
                }
            },

            _ = tokio::time::sleep_until(deadline), if launching => {
                *ctx.status.write() = ConnectionStatus::Failed {
                    reason: "connection timed out".to_string(),
                };
                break;
            }
        }
    }

    // Teardown: stop the workers, wait for them, clear replication state.
    *ctx.state.lock() = SessionState::Quitting;
    let _ = ctx.svc_stop_tx.send(true);
    let _ = ctx.ttl_handle.await;
    let _ = ctx.session_handle.await;
    ctx.graph.write().clear();
    ctx.clients.write().clear();
    *ctx.state.lock() = SessionState::Initial;
}

fn apply_event(ctx: &SupervisorCtx, event: ClientEvent, launching: &mut bool) -> Step {
    match event {
        ClientEvent::StateChange {
            state: ClientState::Syncing | ClientState::SrvSync,
            current,
            total,
        } => {
            *ctx.status.write() = ConnectionStatus::Syncing { current, total };
        }
        ClientEvent::StateChange { .. } => {}
        ClientEvent::Lobby => {
            *launching = false;
            *ctx.status.write() = ConnectionStatus::Lobby;
        }
        ClientEvent::Connected => {
            *launching = false;
            *ctx.state.lock() = SessionState::Active;
            *ctx.status.write() = ConnectionStatus::Connected;
        }
        ClientEvent::ConnectionRefused { reason } => {
            *ctx.status.write() = ConnectionStatus::Refused { reason };
            return Step::Terminal;
        }
        ClientEvent::ConnectionFailed { reason } => {
            *ctx.status.write() = ConnectionStatus::Failed { reason };
            return Step::Terminal;
        }
        ClientEvent::Disconnected { reason } => {
            *ctx.status.write() = ConnectionStatus::Disconnected { reason };
            return Step::Terminal;
        }
        ClientEvent::ClientsState(roster) => {
            *ctx.clients.write() = roster;
        }
        ClientEvent::Settings(settings) => {
            *ctx.settings.write() = Some(settings);
        }
    }
    Step::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksync_core::bindings::BytesBinding;
    use blocksync_core::datablock::NodeState;

    fn session() -> Session {
        let mut registry = BindingRegistry::new();
        registry.register(Box::new(BytesBinding));
        Session::new(SessionConfig::default(), Arc::new(registry))
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = session();
        assert_eq!(session.state(), SessionState::Initial);
        assert_eq!(session.status(), ConnectionStatus::Idle);
        assert!(session.clients().is_empty());
    }

    #[test]
    fn test_add_commit_without_network() {
        let session = session();
        let uuid = session.add_node("alice", "bytes", Box::new(b"payload".to_vec()));
        assert_eq!(
            session.graph().read().get(&uuid).unwrap().state,
            NodeState::Added
        );

        session.commit(&uuid).unwrap();
        assert_eq!(
            session.graph().read().get(&uuid).unwrap().state,
            NodeState::Committed
        );
    }

    #[test]
    fn test_push_requires_connection() {
        let session = session();
        let uuid = session.add_node("alice", "bytes", Box::new(b"payload".to_vec()));
        session.commit(&uuid).unwrap();
        match session.push(&uuid) {
            Err(ReplicationError::State(_)) => {}
            other => panic!("expected State error, got {other:?}"),
        }
    }

    #[test]
    fn test_push_rejects_uncommitted_node() {
        let session = session();
        let uuid = session.add_node("alice", "bytes", Box::new(b"payload".to_vec()));
        // Added, never committed: a push is a caller error.
        match session.push(&uuid) {
            Err(ReplicationError::State(_)) => {}
            other => panic!("expected State error, got {other:?}"),
        }
    }

    #[test]
    fn test_poll_modified_flips_edited_nodes() {
        let session = session();
        let uuid = session.add_node("alice", "bytes", Box::new(b"v1".to_vec()));
        session.commit(&uuid).unwrap();
        {
            let shared = session.graph();
            let mut graph = shared.write();
            let node = graph.get_mut(&uuid).unwrap();
            node.state = NodeState::Up;
            node.instance
                .as_mut()
                .and_then(|i| i.downcast_mut::<Vec<u8>>())
                .unwrap()
                .push(b'!');
        }
        assert_eq!(session.poll_modified(), vec![uuid.clone()]);
        assert_eq!(
            session.graph().read().get(&uuid).unwrap().state,
            NodeState::Modified
        );
    }
}
