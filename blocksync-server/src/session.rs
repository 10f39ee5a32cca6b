//! Authoritative server session.
//!
//! Owns the authoritative graph and the client registry, routes control
//! commands, distributes snapshots to late joiners, accepts the initial
//! seed from the first client, and fans steady-state updates out to every
//! subscriber except the originator.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use blocksync_core::command::{
    AUTH_FAILED_PREFIX, AUTH_LOBBY, AUTH_RUNNING, AuthRequest, AuthRole, ClientInfo, ClientStatus,
    Command, ServerSnapshotMsg, SessionSettings, SnapshotMsg,
};
use blocksync_core::config::{COMMON_OWNER, SERVER_OWNER};
use blocksync_core::datablock::{Datablock, NodeState};
use blocksync_core::error::{ReplicationError, Result};
use blocksync_core::graph::{SharedGraph, shared_graph};
use blocksync_core::protocol::{
    CommandFrame, DatablockFrame, read_identity, read_parts, send_command, send_datablock,
};

use crate::registry::{ClientRegistry, validate_credentials};
use crate::ttl::{TtlControl, TtlEvent, run_ttl_monitor};

/// Server configuration, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for all four listeners.
    pub bind: String,
    /// Base port; command, subscribe, ingest and heartbeat channels bind
    /// to four consecutive ports starting here.
    pub base_port: u16,
    /// Shared secret required for the admin role.
    pub password: String,
    pub connection_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub ttl_tick_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            base_port: 5560,
            password: "admin".to_string(),
            connection_timeout_ms: 5000,
            ping_interval_ms: 1000,
            ttl_tick_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn command_addr(&self) -> String {
        format!("{}:{}", self.bind, self.base_port)
    }

    pub fn subscribe_addr(&self) -> String {
        format!("{}:{}", self.bind, self.base_port + 1)
    }

    pub fn ingest_addr(&self) -> String {
        format!("{}:{}", self.bind, self.base_port + 2)
    }

    pub fn ttl_addr(&self) -> String {
        format!("{}:{}", self.bind, self.base_port + 3)
    }

    /// Load a config from a JSON file; missing file yields the default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| ReplicationError::Data(format!("failed to parse server config: {e}")))
    }
}

/// Lifecycle of the authoritative graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    /// Empty graph, waiting for the first client to seed it.
    Waiting,
    /// Seed handshake in flight.
    SrvSync,
    /// Session running; updates fan out.
    Active,
}

struct SeedState {
    seeder: Uuid,
    expected: HashSet<String>,
}

/// Messages from accept loops and connection readers to the session task.
enum ServerInbound {
    CommandConn { identity: Uuid, writer: OwnedWriteHalf },
    SubscribeConn { identity: Uuid, writer: OwnedWriteHalf },
    Command { identity: Uuid, frame: CommandFrame },
    Data { frame: DatablockFrame },
    CommandClosed { identity: Uuid },
}

#[derive(Clone, Copy)]
enum ChannelKind {
    Command,
    Subscribe,
    Ingest,
}

/// Handle to a running server: introspection plus the shutdown path.
pub struct ServerHandle {
    graph: SharedGraph,
    roster: Arc<RwLock<HashMap<String, ClientInfo>>>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The authoritative graph.
    pub fn graph(&self) -> SharedGraph {
        self.graph.clone()
    }

    /// Snapshot of the connected-client roster, keyed by declared id.
    pub fn clients(&self) -> HashMap<String, ClientInfo> {
        self.roster.read().clone()
    }

    /// Signal every service to stop and wait for them to exit.
    pub async fn shutdown(mut self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Bind all four channels and start the server services.
pub async fn listen(config: ServerConfig) -> Result<ServerHandle> {
    let command_listener = TcpListener::bind(config.command_addr()).await?;
    let subscribe_listener = TcpListener::bind(config.subscribe_addr()).await?;
    let ingest_listener = TcpListener::bind(config.ingest_addr()).await?;
    let ttl_listener = TcpListener::bind(config.ttl_addr()).await?;

    let graph = shared_graph();
    let roster = Arc::new(RwLock::new(HashMap::new()));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (ttl_events_tx, ttl_events_rx) = mpsc::unbounded_channel();
    let (ttl_ctrl_tx, ttl_ctrl_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_ttl_monitor(
        ttl_listener,
        config.connection_timeout_ms,
        config.ping_interval_ms,
        config.ttl_tick_ms,
        ttl_events_tx,
        ttl_ctrl_rx,
        stop_rx.clone(),
    )));
    for (listener, kind) in [
        (command_listener, ChannelKind::Command),
        (subscribe_listener, ChannelKind::Subscribe),
        (ingest_listener, ChannelKind::Ingest),
    ] {
        tasks.push(tokio::spawn(accept_loop(
            listener,
            kind,
            inbound_tx.clone(),
            stop_rx.clone(),
        )));
    }

    info!("listening on base port {}", config.base_port);
    let session = ServerSession::new(config, graph.clone(), roster.clone(), ttl_ctrl_tx);
    tasks.push(tokio::spawn(session.run(inbound_rx, ttl_events_rx, stop_rx)));

    Ok(ServerHandle {
        graph,
        roster,
        stop_tx,
        tasks,
    })
}

async fn accept_loop(
    listener: TcpListener,
    kind: ChannelKind,
    inbound_tx: mpsc::UnboundedSender<ServerInbound>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    stream.set_nodelay(true).ok();
                    tokio::spawn(handle_conn(stream, kind, inbound_tx.clone()));
                }
                Err(err) => warn!("accept failed: {err}"),
            },
        }
    }
}

async fn handle_conn(
    stream: TcpStream,
    kind: ChannelKind,
    inbound_tx: mpsc::UnboundedSender<ServerInbound>,
) {
    let (mut read, writer) = stream.into_split();
    let identity = match read_identity(&mut read).await {
        Ok(identity) => identity,
        Err(err) => {
            debug!("connection without identity hello: {err}");
            return;
        }
    };

    match kind {
        ChannelKind::Command => {
            if inbound_tx
                .send(ServerInbound::CommandConn { identity, writer })
                .is_err()
            {
                return;
            }
            loop {
                match read_parts(&mut read).await {
                    Ok(parts) => match CommandFrame::decode(&parts, true) {
                        Ok(frame) => {
                            if inbound_tx
                                .send(ServerInbound::Command { identity, frame })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(err) => error!("corrupted frame received, skipping it: {err}"),
                    },
                    Err(_) => {
                        let _ = inbound_tx.send(ServerInbound::CommandClosed { identity });
                        return;
                    }
                }
            }
        }
        ChannelKind::Subscribe => {
            // Write-only from the server side; only the writer matters.
            let _ = inbound_tx.send(ServerInbound::SubscribeConn { identity, writer });
        }
        ChannelKind::Ingest => {
            drop(writer);
            loop {
                match read_parts(&mut read).await {
                    Ok(parts) => match DatablockFrame::decode(&parts, true) {
                        Ok(frame) => {
                            if inbound_tx.send(ServerInbound::Data { frame }).is_err() {
                                return;
                            }
                        }
                        Err(err) => error!("corrupted frame received, skipping it: {err}"),
                    },
                    Err(_) => return,
                }
            }
        }
    }
}

struct ServerSession {
    config: ServerConfig,
    state: ServerState,
    graph: SharedGraph,
    registry: ClientRegistry,
    roster_mirror: Arc<RwLock<HashMap<String, ClientInfo>>>,
    command_writers: HashMap<Uuid, OwnedWriteHalf>,
    subscribe_writers: HashMap<Uuid, OwnedWriteHalf>,
    seed: Option<SeedState>,
    ttl_ctrl_tx: mpsc::UnboundedSender<TtlControl>,
}

impl ServerSession {
    fn new(
        config: ServerConfig,
        graph: SharedGraph,
        roster_mirror: Arc<RwLock<HashMap<String, ClientInfo>>>,
        ttl_ctrl_tx: mpsc::UnboundedSender<TtlControl>,
    ) -> Self {
        Self {
            config,
            state: ServerState::Waiting,
            graph,
            registry: ClientRegistry::new(),
            roster_mirror,
            command_writers: HashMap::new(),
            subscribe_writers: HashMap::new(),
            seed: None,
            ttl_ctrl_tx,
        }
    }

    async fn run(
        mut self,
        mut inbound_rx: mpsc::UnboundedReceiver<ServerInbound>,
        mut ttl_events_rx: mpsc::UnboundedReceiver<TtlEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                maybe = inbound_rx.recv() => match maybe {
                    Some(inbound) => self.handle_inbound(inbound).await,
                    None => break,
                },
                maybe = ttl_events_rx.recv() => match maybe {
                    Some(event) => self.handle_ttl_event(event).await,
                    None => break,
                },
            }
        }
        info!("server session stopped");
    }

    async fn handle_inbound(&mut self, inbound: ServerInbound) {
        match inbound {
            ServerInbound::CommandConn { identity, writer } => {
                self.command_writers.insert(identity, writer);
            }
            ServerInbound::SubscribeConn { identity, writer } => {
                self.subscribe_writers.insert(identity, writer);
            }
            ServerInbound::Command { identity, frame } => {
                self.handle_command(identity, frame).await;
            }
            ServerInbound::Data { frame } => self.handle_data(frame).await,
            ServerInbound::CommandClosed { identity } => {
                if self.registry.contains(identity) {
                    self.disconnect_client(identity, "connection closed").await;
                } else {
                    self.command_writers.remove(&identity);
                    self.subscribe_writers.remove(&identity);
                }
            }
        }
    }

    async fn handle_command(&mut self, identity: Uuid, frame: CommandFrame) {
        let CommandFrame { owner, command, .. } = frame;

        if !matches!(command, Command::Auth(_)) && !self.registry.contains(identity) {
            debug!(%identity, "dropping {} frame from unregistered client", command.tag());
            return;
        }

        match command {
            Command::Auth(request) => self.handle_auth(identity, request).await,
            Command::Snapshot(msg) => self.handle_snapshot(identity, msg).await,
            Command::ServerSnapshot(msg) => self.handle_seed(identity, msg).await,
            command @ (Command::Delete { .. } | Command::ChangeOwner { .. }) => {
                self.handle_graph_command(identity, &owner, command).await;
            }
            Command::UserMetadata(metadata) => {
                self.registry.merge_metadata(identity, metadata);
                self.broadcast_roster().await;
            }
            Command::Kick { user } => self.handle_kick(identity, &user).await,
            other => debug!("ignoring {} frame from client", other.tag()),
        }
    }

    async fn handle_auth(&mut self, identity: Uuid, request: AuthRequest) {
        let status = self.login(identity, &request);
        let failed = status.starts_with(AUTH_FAILED_PREFIX);
        if failed {
            warn!("refusing {}: {status}", request.auth_id);
        }
        self.send_command_to(identity, Command::AuthStatus(status))
            .await;
        if !failed {
            let settings = SessionSettings {
                ping_interval_ms: self.config.ping_interval_ms,
                timeout_ms: self.config.connection_timeout_ms,
            };
            self.send_command_to(identity, Command::Config(settings))
                .await;
            self.broadcast_roster().await;
        }
    }

    fn login(&mut self, identity: Uuid, request: &AuthRequest) -> String {
        if let Err(reason) = validate_credentials(request, &self.config.password) {
            return format!("{AUTH_FAILED_PREFIX}{reason}");
        }
        let admin = request.auth_type == AuthRole::Admin;
        if let Err(reason) = self.registry.register(identity, &request.auth_id, admin) {
            return format!("{AUTH_FAILED_PREFIX}{reason}");
        }
        info!("{} logged in", request.auth_id);
        if matches!(self.state, ServerState::Waiting | ServerState::SrvSync) {
            AUTH_LOBBY.to_string()
        } else {
            AUTH_RUNNING.to_string()
        }
    }

    async fn handle_snapshot(&mut self, identity: Uuid, msg: SnapshotMsg) {
        match msg {
            SnapshotMsg::RequestInit => self.send_snapshot_init(identity).await,
            SnapshotMsg::Get { id } => {
                let frame = {
                    let graph = self.graph.read();
                    graph.get(&id).map(|node| DatablockFrame::from_node(node, None))
                };
                match frame {
                    Some(Ok(frame)) => self.send_datablock_to(identity, &frame).await,
                    Some(Err(err)) => error!("cannot serve snapshot {id}: {err}"),
                    None => error!("snapshot request for unknown node {id}"),
                }
            }
            SnapshotMsg::Done => {
                if let Some(client) = self.registry.get(identity) {
                    info!("{} up to date", client.id);
                }
                self.registry.set_status(identity, ClientStatus::Active);
                self.broadcast_roster().await;
            }
            SnapshotMsg::Init { .. } => debug!("ignoring snapshot catalog from a client"),
        }
    }

    async fn send_snapshot_init(&mut self, identity: Uuid) {
        let catalog = self.graph.read().uuids();
        if let Some(client) = self.registry.get(identity) {
            info!("pushing {} nodes to {}", catalog.len(), client.id);
        }
        self.send_command_to(identity, Command::Snapshot(SnapshotMsg::Init { catalog }))
            .await;
    }

    async fn handle_seed(&mut self, identity: Uuid, msg: ServerSnapshotMsg) {
        match msg {
            ServerSnapshotMsg::Init { nodes } => {
                let accepted = self.state == ServerState::Waiting
                    && self.seed.is_none()
                    && self.graph.read().is_empty();
                if !accepted {
                    warn!("rejecting seed from {identity}: server already has content");
                    self.send_command_to(
                        identity,
                        Command::ServerSnapshot(ServerSnapshotMsg::Rejected),
                    )
                    .await;
                    return;
                }
                self.state = ServerState::SrvSync;
                let expected: HashSet<String> = nodes.into_iter().collect();
                let empty = expected.is_empty();
                self.seed = Some(SeedState {
                    seeder: identity,
                    expected,
                });
                self.send_command_to(
                    identity,
                    Command::ServerSnapshot(ServerSnapshotMsg::Accepted),
                )
                .await;
                if empty {
                    self.finish_seed(identity).await;
                }
            }
            ServerSnapshotMsg::Set { node } => {
                let Some(seed) = self.seed.as_mut() else {
                    warn!("seed data outside a seed handshake");
                    return;
                };
                if seed.seeder != identity {
                    warn!("seed data from a non-seeding client");
                    return;
                }
                seed.expected.remove(&node.uuid);
                let done = seed.expected.is_empty();
                {
                    let mut graph = self.graph.write();
                    let mut block = Datablock::from_wire(
                        node.uuid,
                        node.owner,
                        node.type_name,
                        node.dependencies,
                        Bytes::from(node.data),
                        Some(identity),
                    );
                    block.state = NodeState::Up;
                    graph.insert(block);
                }
                if done {
                    self.finish_seed(identity).await;
                }
            }
            ServerSnapshotMsg::End => {
                self.registry.set_status(identity, ClientStatus::Active);
                self.broadcast_roster().await;
            }
            _ => debug!("ignoring seed reply from a client"),
        }
    }

    async fn finish_seed(&mut self, seeder: Uuid) {
        self.seed = None;
        self.state = ServerState::Active;
        info!("seed complete, session running");
        self.send_command_to(seeder, Command::ServerSnapshot(ServerSnapshotMsg::Done))
            .await;
        // Release snapshot access to every other already-connected client.
        for identity in self.registry.identities() {
            if identity != seeder {
                self.send_snapshot_init(identity).await;
            }
        }
    }

    async fn handle_graph_command(&mut self, identity: Uuid, principal: &str, command: Command) {
        let uuid = match &command {
            Command::Delete { uuid } => uuid.clone(),
            Command::ChangeOwner { uuid, .. } => uuid.clone(),
            _ => return,
        };
        let allowed = {
            let graph = self.graph.read();
            match graph.get(&uuid) {
                Some(node) => {
                    principal == SERVER_OWNER
                        || node.owner == principal
                        || node.owner == COMMON_OWNER
                }
                None => true,
            }
        };
        if !allowed {
            warn!("rejecting {} on {uuid}: node is owned by another client", command.tag());
            return;
        }
        if !command.execute(&mut self.graph.write()) {
            debug!("{} on {uuid} changed nothing", command.tag());
        }
        self.broadcast_command_except(Some(identity), command).await;
    }

    async fn handle_kick(&mut self, requester: Uuid, user: &str) {
        if !self.registry.is_admin(requester) {
            warn!("ignoring kick of {user} from a non-admin client");
            return;
        }
        match self.registry.identity_of(user) {
            Some(target) => {
                self.send_command_to(
                    target,
                    Command::Disconnect {
                        reason: "kicked by admin".to_string(),
                    },
                )
                .await;
                let _ = self.ttl_ctrl_tx.send(TtlControl::StopWatching(target));
                self.disconnect_client(target, "kicked").await;
                warn!("{user} kicked from the session");
            }
            None => error!("can't kick {user}, user not found"),
        }
    }

    async fn disconnect_client(&mut self, identity: Uuid, reason: &str) {
        let Some(info) = self.registry.remove(identity) else {
            return;
        };
        // Release every node the leaving client owned back to the common
        // principal, on our copy and on every remaining client's.
        let owned = self.graph.read().owned_by(&info.id);
        for uuid in owned {
            debug!("changing node {uuid} rights to {COMMON_OWNER}");
            let command = Command::ChangeOwner {
                uuid,
                new_owner: COMMON_OWNER.to_string(),
            };
            command.execute(&mut self.graph.write());
            self.broadcast_command_except(Some(identity), command).await;
        }
        self.command_writers.remove(&identity);
        self.subscribe_writers.remove(&identity);
        let _ = self.ttl_ctrl_tx.send(TtlControl::StopWatching(identity));
        info!("{} disconnected from the server [{reason}]", info.id);
        self.broadcast_roster().await;
    }

    async fn handle_data(&mut self, frame: DatablockFrame) {
        let sender = frame.sender;
        let allowed = {
            let graph = self.graph.read();
            match graph.get(&frame.uuid) {
                Some(node) => node.owner == frame.owner || node.owner == COMMON_OWNER,
                None => true,
            }
        };
        if !allowed {
            warn!("rejecting update of {} from a non-owner", frame.uuid);
            return;
        }
        {
            let mut graph = self.graph.write();
            let node = graph.store(frame.clone());
            // The server copy is the acknowledged, authoritative one.
            node.state = NodeState::Up;
        }
        if self.state == ServerState::Active {
            for identity in self.registry.identities() {
                if Some(identity) != sender {
                    self.send_datablock_to(identity, &frame).await;
                }
            }
        }
    }

    async fn handle_ttl_event(&mut self, event: TtlEvent) {
        match event {
            TtlEvent::Lost(identity) => {
                self.disconnect_client(identity, "connection closed").await;
            }
            TtlEvent::Latency(table) => {
                let mut changed = false;
                for (identity, latency) in table {
                    if self.registry.contains(identity) {
                        self.registry.set_latency(identity, latency);
                        changed = true;
                    } else {
                        let _ = self.ttl_ctrl_tx.send(TtlControl::StopWatching(identity));
                    }
                }
                if changed {
                    self.broadcast_roster().await;
                }
            }
        }
    }

    async fn send_command_to(&mut self, identity: Uuid, command: Command) {
        let frame = CommandFrame::new(SERVER_OWNER, command);
        let Some(writer) = self.command_writers.get_mut(&identity) else {
            debug!(%identity, "no command socket for client");
            return;
        };
        if let Err(err) = send_command(writer, &frame, false).await {
            debug!(%identity, "command send failed: {err}");
            self.command_writers.remove(&identity);
        }
    }

    async fn send_datablock_to(&mut self, identity: Uuid, frame: &DatablockFrame) {
        let Some(writer) = self.subscribe_writers.get_mut(&identity) else {
            debug!(%identity, "no subscription socket for client");
            return;
        };
        if let Err(err) = send_datablock(writer, frame, false).await {
            debug!(%identity, "datablock send failed: {err}");
            self.subscribe_writers.remove(&identity);
        }
    }

    async fn broadcast_command_except(&mut self, except: Option<Uuid>, command: Command) {
        for identity in self.registry.identities() {
            if Some(identity) == except {
                continue;
            }
            self.send_command_to(identity, command.clone()).await;
        }
    }

    async fn broadcast_roster(&mut self) {
        let roster = self.registry.roster();
        *self.roster_mirror.write() = roster.clone();
        for identity in self.registry.identities() {
            self.send_command_to(identity, Command::ClientsState(roster.clone()))
                .await;
        }
    }
}
