//! Client session worker.
//!
//! Owns the command, subscription and ingest sockets. Authenticates on
//! startup, synchronizes the local graph mirror from the server's catalog
//! (or seeds an empty server), then settles into steady-state exchange:
//! draining the outgoing queue and applying everything that arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use blocksync_core::bindings::BindingRegistry;
use blocksync_core::command::{
    AUTH_FAILED_PREFIX, AUTH_LOBBY, AUTH_RUNNING, AuthRequest, AuthRole, ClientInfo, Command,
    SeedNode, ServerSnapshotMsg, SessionSettings, SnapshotMsg,
};
use blocksync_core::config::{PROTOCOL_VERSION, SessionConfig};
use blocksync_core::datablock::NodeState;
use blocksync_core::error::{ReplicationError, Result};
use blocksync_core::graph::SharedGraph;
use blocksync_core::protocol::{
    CommandFrame, DatablockFrame, read_parts, send_command, send_datablock, write_identity,
};

/// Client session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Initial,
    Auth,
    Lobby,
    /// Seeding the server's empty graph.
    SrvSync,
    /// Catalog-driven snapshot sync in progress.
    Syncing,
    Active,
    Quitting,
}

/// Events raised towards the orchestrator.
#[derive(Debug)]
pub enum ClientEvent {
    StateChange {
        state: ClientState,
        current: usize,
        total: usize,
    },
    Lobby,
    Connected,
    ConnectionRefused { reason: String },
    ConnectionFailed { reason: String },
    Disconnected { reason: String },
    ClientsState(HashMap<String, ClientInfo>),
    /// Settings advertised by the server after auth.
    Settings(SessionSettings),
}

/// Requests the host application relays through the session.
#[derive(Debug)]
pub enum HostCommand {
    Kick { user: String },
    UpdateMetadata(HashMap<String, String>),
}

/// Connection parameters for one session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Declared identity (user-visible name).
    pub id: String,
    /// Shared secret; supplying one requests the admin role.
    pub password: Option<String>,
    /// Seed the server's graph from the local one when the session is
    /// still in the lobby (hosting).
    pub seed: bool,
}

/// Bookkeeping for a catalog-driven snapshot sync.
#[derive(Default)]
pub(crate) struct SnapshotTracker {
    catalog: VecDeque<String>,
    current: Option<String>,
    late_updates: Vec<DatablockFrame>,
    progress: usize,
    total: usize,
}

pub(crate) enum SnapshotStep {
    /// The outstanding request arrived; `next` is the following uuid to
    /// fetch, or `None` when the catalog is exhausted.
    Expected { next: Option<String> },
    /// A live update raced ahead of the snapshot; queue it.
    Late,
}

impl SnapshotTracker {
    /// Start a sync over the given catalog; returns the first uuid to
    /// fetch, or `None` for an empty catalog.
    pub(crate) fn begin(&mut self, catalog: Vec<String>) -> Option<String> {
        self.total = catalog.len();
        self.progress = 0;
        self.catalog = catalog.into();
        self.late_updates.clear();
        self.current = self.catalog.pop_front();
        self.current.clone()
    }

    pub(crate) fn on_frame(&mut self, uuid: &str) -> SnapshotStep {
        if self.current.as_deref() == Some(uuid) {
            self.progress += 1;
            self.current = self.catalog.pop_front();
            SnapshotStep::Expected {
                next: self.current.clone(),
            }
        } else {
            SnapshotStep::Late
        }
    }

    pub(crate) fn push_late(&mut self, frame: DatablockFrame) {
        self.late_updates.push(frame);
    }

    /// Queued late updates, in arrival order.
    pub(crate) fn take_late(&mut self) -> Vec<DatablockFrame> {
        std::mem::take(&mut self.late_updates)
    }

    pub(crate) fn progress(&self) -> usize {
        self.progress
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Run the client session worker until it stops or is stopped.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_client_session(
    config: SessionConfig,
    identity: Uuid,
    options: ConnectOptions,
    graph: SharedGraph,
    registry: Arc<BindingRegistry>,
    outgoing_rx: mpsc::UnboundedReceiver<String>,
    host_rx: mpsc::UnboundedReceiver<HostCommand>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    stop_rx: watch::Receiver<bool>,
) {
    let events = events_tx.clone();
    if let Err(err) = session_inner(
        config,
        identity,
        options,
        graph,
        registry,
        outgoing_rx,
        host_rx,
        events_tx,
        stop_rx,
    )
    .await
    {
        let _ = events.send(ClientEvent::ConnectionFailed {
            reason: err.to_string(),
        });
    }
}

struct ClientSession {
    identity: Uuid,
    id: String,
    seed: bool,
    state: ClientState,
    graph: SharedGraph,
    registry: Arc<BindingRegistry>,
    cmd_writer: OwnedWriteHalf,
    ingest_writer: OwnedWriteHalf,
    // Held so the subscription connection stays open.
    _sub_writer: OwnedWriteHalf,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    snapshot: SnapshotTracker,
}

#[allow(clippy::too_many_arguments)]
async fn session_inner(
    config: SessionConfig,
    identity: Uuid,
    options: ConnectOptions,
    graph: SharedGraph,
    registry: Arc<BindingRegistry>,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    mut host_rx: mpsc::UnboundedReceiver<HostCommand>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    info!("connecting on {}:{}", config.host, config.base_port);
    let command = TcpStream::connect(config.command_addr()).await?;
    let subscribe = TcpStream::connect(config.subscribe_addr()).await?;
    let ingest = TcpStream::connect(config.ingest_addr()).await?;
    command.set_nodelay(true).ok();
    ingest.set_nodelay(true).ok();

    let (cmd_read, mut cmd_writer) = command.into_split();
    write_identity(&mut cmd_writer, identity).await?;
    let (sub_read, mut sub_writer) = subscribe.into_split();
    write_identity(&mut sub_writer, identity).await?;
    let (_ingest_read, mut ingest_writer) = ingest.into_split();
    write_identity(&mut ingest_writer, identity).await?;

    let (cmd_tx, mut cmd_frames) = mpsc::unbounded_channel();
    tokio::spawn(command_reader(cmd_read, cmd_tx));
    let (sub_tx, mut sub_frames) = mpsc::unbounded_channel();
    tokio::spawn(subscribe_reader(sub_read, sub_tx));

    let mut session = ClientSession {
        identity,
        id: options.id.clone(),
        seed: options.seed,
        state: ClientState::Initial,
        graph,
        registry,
        cmd_writer,
        ingest_writer,
        _sub_writer: sub_writer,
        events_tx,
        snapshot: SnapshotTracker::default(),
    };

    // Authenticate immediately; the reply drives everything else.
    let auth_type = if options.password.is_some() {
        AuthRole::Admin
    } else {
        AuthRole::Client
    };
    session
        .send_command(Command::Auth(AuthRequest {
            auth_type,
            auth_id: options.id,
            password: options.password,
            version: PROTOCOL_VERSION.to_string(),
        }))
        .await?;
    session.set_state(ClientState::Auth);

    let connection_started = Instant::now();
    let auth_timeout = Duration::from_millis(config.connection_timeout_ms);
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut outgoing_open = true;
    let mut host_open = true;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                session.set_state(ClientState::Quitting);
                break;
            }

            maybe = cmd_frames.recv() => match maybe {
                Some(frame) => {
                    if let Flow::Stop = session.handle_command(frame).await? {
                        break;
                    }
                }
                None => {
                    session.emit(ClientEvent::Disconnected {
                        reason: "connection closed".to_string(),
                    });
                    break;
                }
            },

            maybe = sub_frames.recv() => match maybe {
                Some(frame) => session.handle_datablock(frame).await?,
                None => {
                    session.emit(ClientEvent::Disconnected {
                        reason: "connection closed".to_string(),
                    });
                    break;
                }
            },

            maybe = outgoing_rx.recv(), if outgoing_open
                && matches!(session.state, ClientState::Active | ClientState::SrvSync) =>
            {
                match maybe {
                    Some(uuid) => session.push_node(&uuid).await,
                    None => outgoing_open = false,
                }
            }

            maybe = host_rx.recv(), if host_open => match maybe {
                Some(command) => session.handle_host(command).await?,
                None => host_open = false,
            },

            _ = tick.tick() => {
                if session.state == ClientState::Auth
                    && connection_started.elapsed() > auth_timeout
                {
                    session.emit(ClientEvent::ConnectionFailed {
                        reason: "connection timed out".to_string(),
                    });
                    break;
                }
            }
        }
    }
    Ok(())
}

impl ClientSession {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&mut self, state: ClientState) {
        self.state = state;
        self.emit(ClientEvent::StateChange {
            state,
            current: self.snapshot.progress(),
            total: self.snapshot.total(),
        });
    }

    async fn send_command(&mut self, command: Command) -> Result<()> {
        let frame = CommandFrame::with_sender(self.identity, self.id.clone(), command);
        send_command(&mut self.cmd_writer, &frame, true).await
    }

    async fn handle_command(&mut self, frame: CommandFrame) -> Result<Flow> {
        match frame.command {
            Command::AuthStatus(status) => return self.handle_auth_status(&status).await,
            Command::Config(settings) => self.emit(ClientEvent::Settings(settings)),
            Command::Disconnect { reason } => {
                self.emit(ClientEvent::Disconnected { reason });
                return Ok(Flow::Stop);
            }
            Command::ClientsState(roster) => self.emit(ClientEvent::ClientsState(roster)),
            Command::Snapshot(SnapshotMsg::Init { catalog }) => {
                self.handle_snapshot_init(catalog).await?;
            }
            Command::ServerSnapshot(msg) => self.handle_seed_reply(msg).await?,
            command @ (Command::Delete { .. } | Command::ChangeOwner { .. }) => {
                command.execute(&mut self.graph.write());
            }
            other => debug!("ignoring {} frame from server", other.tag()),
        }
        Ok(Flow::Continue)
    }

    async fn handle_auth_status(&mut self, status: &str) -> Result<Flow> {
        if self.state != ClientState::Auth {
            warn!("auth reply outside the auth handshake, skipping it");
            return Ok(Flow::Continue);
        }
        if let Some(reason) = status.strip_prefix(AUTH_FAILED_PREFIX) {
            self.emit(ClientEvent::ConnectionRefused {
                reason: reason.trim().to_string(),
            });
            return Ok(Flow::Stop);
        }
        match status {
            AUTH_LOBBY => {
                self.set_state(ClientState::Lobby);
                self.emit(ClientEvent::Lobby);
                if self.seed {
                    self.request_server_init().await?;
                }
            }
            AUTH_RUNNING => {
                self.set_state(ClientState::Lobby);
                self.request_snapshot_init().await?;
            }
            other => warn!("unknown auth status {other:?}, skipping it"),
        }
        Ok(Flow::Continue)
    }

    /// Ask the server for the snapshot catalog.
    async fn request_snapshot_init(&mut self) -> Result<()> {
        info!("requesting snapshot init");
        self.send_command(Command::Snapshot(SnapshotMsg::RequestInit))
            .await
    }

    /// Offer the local graph as the server's initial content.
    async fn request_server_init(&mut self) -> Result<()> {
        let nodes = self.graph.read().uuids();
        info!("requesting server init with {} nodes", nodes.len());
        self.send_command(Command::ServerSnapshot(ServerSnapshotMsg::Init { nodes }))
            .await?;
        self.set_state(ClientState::SrvSync);
        Ok(())
    }

    async fn handle_snapshot_init(&mut self, catalog: Vec<String>) -> Result<()> {
        if !matches!(self.state, ClientState::Lobby | ClientState::Syncing) {
            warn!("snapshot catalog outside sync, skipping it");
            return Ok(());
        }
        match self.snapshot.begin(catalog) {
            Some(first) => {
                self.set_state(ClientState::Syncing);
                self.request_node(&first).await?;
            }
            None => {
                // Nothing to fetch; the session is immediately up to date.
                self.set_state(ClientState::Syncing);
                self.finish_sync().await?;
            }
        }
        Ok(())
    }

    async fn request_node(&mut self, uuid: &str) -> Result<()> {
        debug!("get {uuid}");
        self.send_command(Command::Snapshot(SnapshotMsg::Get {
            id: uuid.to_string(),
        }))
        .await
    }

    async fn finish_sync(&mut self) -> Result<()> {
        for late in self.snapshot.take_late() {
            info!("applying late update: {}", late.uuid);
            self.store_and_apply(late);
        }
        self.send_command(Command::Snapshot(SnapshotMsg::Done))
            .await?;
        info!("snapshot done");
        self.set_state(ClientState::Active);
        self.emit(ClientEvent::Connected);
        Ok(())
    }

    async fn handle_seed_reply(&mut self, msg: ServerSnapshotMsg) -> Result<()> {
        if self.state != ClientState::SrvSync {
            debug!("seed reply outside seeding, skipping it");
            return Ok(());
        }
        match msg {
            ServerSnapshotMsg::Accepted => self.stream_seed().await?,
            ServerSnapshotMsg::Done => {
                self.set_state(ClientState::Active);
                self.emit(ClientEvent::Connected);
            }
            ServerSnapshotMsg::Rejected => {
                error!("local snapshot refused by the server");
                self.set_state(ClientState::Lobby);
            }
            _ => debug!("ignoring seed message from server"),
        }
        Ok(())
    }

    /// Stream every local node to the server, one `Set` per node, then
    /// `End`.
    async fn stream_seed(&mut self) -> Result<()> {
        let nodes: Vec<SeedNode> = {
            let mut graph = self.graph.write();
            let uuids = graph.uuids();
            let mut nodes = Vec::with_capacity(uuids.len());
            for uuid in uuids {
                let Some(node) = graph.get_mut(&uuid) else {
                    continue;
                };
                // Nodes the host already committed are ready as-is.
                if node.state != NodeState::Committed {
                    if let Err(err) = node.commit(&self.registry) {
                        error!("skipping seed of {uuid}: {err}");
                        continue;
                    }
                }
                node.state = NodeState::Up;
                let Some(buffer) = node.buffer.as_ref() else {
                    continue;
                };
                nodes.push(SeedNode {
                    uuid: node.uuid.clone(),
                    owner: node.owner.clone(),
                    type_name: node.type_name.clone(),
                    dependencies: node.dependencies.clone(),
                    data: buffer.to_vec(),
                });
            }
            nodes
        };
        let total = nodes.len();
        for (index, node) in nodes.into_iter().enumerate() {
            self.send_command(Command::ServerSnapshot(ServerSnapshotMsg::Set { node }))
                .await?;
            self.emit(ClientEvent::StateChange {
                state: self.state,
                current: index + 1,
                total,
            });
        }
        self.send_command(Command::ServerSnapshot(ServerSnapshotMsg::End))
            .await
    }

    async fn handle_datablock(&mut self, frame: DatablockFrame) -> Result<()> {
        match self.state {
            ClientState::Syncing => match self.snapshot.on_frame(&frame.uuid) {
                SnapshotStep::Expected { next } => {
                    self.store_and_apply(frame);
                    self.emit(ClientEvent::StateChange {
                        state: self.state,
                        current: self.snapshot.progress(),
                        total: self.snapshot.total(),
                    });
                    match next {
                        Some(uuid) => self.request_node(&uuid).await?,
                        None => self.finish_sync().await?,
                    }
                }
                SnapshotStep::Late => {
                    info!("queuing a late update: {}", frame.uuid);
                    self.snapshot.push_late(frame);
                }
            },
            ClientState::Active => self.store_and_apply(frame),
            _ => debug!("dropping datablock {} in state {:?}", frame.uuid, self.state),
        }
        Ok(())
    }

    /// Store a received frame into the mirror and apply it through its
    /// binding. A missing binding skips the node, never the sync.
    fn store_and_apply(&mut self, frame: DatablockFrame) {
        let mut graph = self.graph.write();
        let node = graph.store(frame);
        if let Err(err) = node.apply(&self.registry) {
            match err {
                ReplicationError::UnsupportedType(_) => {
                    warn!("skipping node {}: {err}", node.uuid);
                }
                err => warn!("failed to apply node {}: {err}", node.uuid),
            }
        }
    }

    /// Push one queued node to the server. Failures are logged per node;
    /// they never take down the session.
    async fn push_node(&mut self, uuid: &str) {
        let frame = {
            let graph = self.graph.read();
            match graph.get(uuid) {
                Some(node) => DatablockFrame::from_node(node, Some(self.identity)),
                None => Err(ReplicationError::State(format!(
                    "node {uuid} is not in the graph"
                ))),
            }
        };
        match frame {
            Ok(frame) => match send_datablock(&mut self.ingest_writer, &frame, true).await {
                Ok(()) => {
                    if let Some(node) = self.graph.write().get_mut(uuid) {
                        node.state = NodeState::Up;
                    }
                }
                Err(err) => error!("failed to push {uuid}: {err}"),
            },
            Err(err) => error!("failed to push {uuid}: {err}"),
        }
    }

    async fn handle_host(&mut self, command: HostCommand) -> Result<()> {
        match command {
            HostCommand::Kick { user } => self.send_command(Command::Kick { user }).await,
            HostCommand::UpdateMetadata(metadata) => {
                self.send_command(Command::UserMetadata(metadata)).await
            }
        }
    }
}

async fn command_reader(mut read: OwnedReadHalf, tx: mpsc::UnboundedSender<CommandFrame>) {
    loop {
        match read_parts(&mut read).await {
            Ok(parts) => match CommandFrame::decode(&parts, false) {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(err) => error!("corrupted frame received, skipping it: {err}"),
            },
            Err(_) => return,
        }
    }
}

async fn subscribe_reader(mut read: OwnedReadHalf, tx: mpsc::UnboundedSender<DatablockFrame>) {
    loop {
        match read_parts(&mut read).await {
            Ok(parts) => match DatablockFrame::decode(&parts, false) {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(err) => error!("corrupted frame received, skipping it: {err}"),
            },
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(uuid: &str) -> DatablockFrame {
        DatablockFrame {
            sender: None,
            uuid: uuid.to_string(),
            owner: "alice".to_string(),
            type_name: "bytes".to_string(),
            dependencies: vec![],
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn test_snapshot_fetches_catalog_in_order() {
        let mut tracker = SnapshotTracker::default();
        let first = tracker.begin(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(tracker.total(), 3);

        match tracker.on_frame("a") {
            SnapshotStep::Expected { next } => assert_eq!(next.as_deref(), Some("b")),
            SnapshotStep::Late => panic!("expected fetch was treated as late"),
        }
        match tracker.on_frame("b") {
            SnapshotStep::Expected { next } => assert_eq!(next.as_deref(), Some("c")),
            SnapshotStep::Late => panic!("expected fetch was treated as late"),
        }
        match tracker.on_frame("c") {
            SnapshotStep::Expected { next } => assert!(next.is_none()),
            SnapshotStep::Late => panic!("expected fetch was treated as late"),
        }
        assert_eq!(tracker.progress(), 3);
    }

    #[test]
    fn test_late_updates_queued_and_drained_once() {
        let mut tracker = SnapshotTracker::default();
        tracker.begin(vec!["a".into(), "b".into()]);

        // A live update races ahead of the snapshot.
        match tracker.on_frame("x") {
            SnapshotStep::Late => tracker.push_late(frame("x")),
            SnapshotStep::Expected { .. } => panic!("raced update treated as expected"),
        }
        match tracker.on_frame("a") {
            SnapshotStep::Expected { next } => assert_eq!(next.as_deref(), Some("b")),
            SnapshotStep::Late => panic!(),
        }
        // Another raced update arrives mid-sync.
        match tracker.on_frame("q") {
            SnapshotStep::Late => tracker.push_late(frame("q")),
            SnapshotStep::Expected { .. } => panic!(),
        }
        match tracker.on_frame("b") {
            SnapshotStep::Expected { next } => assert!(next.is_none()),
            SnapshotStep::Late => panic!(),
        }

        // Exactly the two raced updates, in arrival order, exactly once.
        let late = tracker.take_late();
        let uuids: Vec<&str> = late.iter().map(|f| f.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["x", "q"]);
        assert!(tracker.take_late().is_empty());
        assert_eq!(tracker.progress(), 2);
        assert_eq!(tracker.total(), 2);
    }

    #[test]
    fn test_empty_catalog_completes_immediately() {
        let mut tracker = SnapshotTracker::default();
        assert!(tracker.begin(vec![]).is_none());
        assert_eq!(tracker.total(), 0);
        assert_eq!(tracker.progress(), 0);
    }
}
