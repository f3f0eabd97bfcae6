//! Connection lifecycle: the network context.
//!
//! One tokio task owns every mutable piece of connection state (the status
//! machine, the peer snapshot, the session slot, the listener, discovery
//! handles and the reconnect timer). Requests from [`ConnectionManager`]
//! and completions from spawned I/O are processed strictly one at a time.
//!
//! Every start or stop bumps a generation counter. Spawned work reports back
//! tagged with the generation (and session id) it was created under, so a
//! completion that raced a restart is recognised as stale and dropped.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::session::{Session, SessionEvent, SessionSink};
use crate::discovery::{
    DiscoveredPeer, Discovery, DiscoveryEvent, DiscoveryHandle, SnapshotSink, default_instance_name,
};
use crate::error::SyncError;
use crate::message::{Command, Role};
use crate::state::{ConnectionStatus, StatusEvent, StatusMachine};
use crate::task::{OneShotTimer, TaskGuard};

/// Delay before a failed session is retried.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ── Public surface ───────────────────────────────────────────────

/// Static knobs for the network context.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Name advertised by a follower.
    pub instance_name: String,
    /// Address the follower listener binds to.
    pub listen_address: IpAddr,
    pub reconnect_delay: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Observations published by the network context, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionStatus),
    PeersChanged(Vec<DiscoveredPeer>),
    ConnectedPeerChanged(Option<String>),
    CommandReceived(Command),
}

/// Parse follower port text: trimmed decimal in `1..=65535`.
pub fn parse_port(text: &str) -> Result<u16, SyncError> {
    match text.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(SyncError::InvalidPort(text.to_string())),
    }
}

/// The peer a controller should dial: the preferred name if present,
/// otherwise the first peer in the (sorted) snapshot.
pub fn select_peer<'a>(
    peers: &'a [DiscoveredPeer],
    preferred: Option<&str>,
) -> Option<&'a DiscoveredPeer> {
    preferred
        .and_then(|name| peers.iter().find(|p| p.name() == name))
        .or_else(|| peers.first())
}

/// Handle to the network context. Cheap to clone; the context shuts down
/// once every handle is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    requests: mpsc::UnboundedSender<Request>,
}

impl ConnectionManager {
    /// Spawn the network context on the current runtime.
    pub fn spawn(
        discovery: Arc<dyn Discovery>,
        settings: LifecycleSettings,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();

        let ctx = NetworkContext::new(discovery, settings, events, io_tx);
        tokio::spawn(ctx.run(request_rx, io_rx));

        (Self { requests }, event_rx)
    }

    /// Stop whatever runs and start browsing as a controller.
    pub fn start_controller(&self, preferred: Option<String>) -> Result<(), SyncError> {
        self.requests.send(Request::StartController { preferred })?;
        Ok(())
    }

    /// Stop whatever runs and listen as a follower on `port`.
    pub fn start_follower(&self, port: impl Into<String>) -> Result<(), SyncError> {
        self.requests.send(Request::StartFollower { port: port.into() })?;
        Ok(())
    }

    /// Update the name hint used for the next peer selection.
    pub fn set_preferred_peer(&self, name: Option<String>) -> Result<(), SyncError> {
        self.requests.send(Request::SetPreferredPeer(name))?;
        Ok(())
    }

    /// Fire-and-forget: dropped when there is no ready session.
    pub fn send(&self, command: Command) -> Result<(), SyncError> {
        self.requests.send(Request::Send(command))?;
        Ok(())
    }

    /// Tear everything down. Returns once the network context has done so.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let (ack, done) = oneshot::channel();
        self.requests.send(Request::Stop(ack))?;
        done.await.map_err(|_| SyncError::ChannelClosed)
    }
}

// ── Network context ──────────────────────────────────────────────

#[derive(Debug)]
enum Request {
    StartController { preferred: Option<String> },
    StartFollower { port: String },
    SetPreferredPeer(Option<String>),
    Send(Command),
    Stop(oneshot::Sender<()>),
}

/// Completions from spawned I/O.
#[derive(Debug)]
enum IoEvent {
    Snapshot {
        generation: u64,
        peers: Vec<DiscoveredPeer>,
    },
    BrowseFailed {
        generation: u64,
        message: String,
    },
    Dialed {
        generation: u64,
        session: u64,
        result: Result<TcpStream, SyncError>,
    },
    Accepted {
        generation: u64,
        stream: TcpStream,
        addr: SocketAddr,
    },
    Session {
        generation: u64,
        session: u64,
        event: SessionEvent,
    },
    ReconnectFired {
        generation: u64,
        seq: u64,
    },
}

/// At most one session per role, pending or ready.
#[derive(Debug, Default)]
enum SessionSlot {
    #[default]
    Idle,
    Dialing {
        id: u64,
        peer_name: String,
        _task: TaskGuard,
    },
    Ready(Session),
}

impl SessionSlot {
    fn is_idle(&self) -> bool {
        matches!(self, SessionSlot::Idle)
    }

    fn ready_id(&self) -> Option<u64> {
        match self {
            SessionSlot::Ready(s) => Some(s.id()),
            _ => None,
        }
    }
}

struct NetworkContext {
    discovery: Arc<dyn Discovery>,
    settings: LifecycleSettings,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    io_tx: mpsc::UnboundedSender<IoEvent>,

    machine: StatusMachine,
    generation: u64,
    role: Option<Role>,
    preferred: Option<String>,
    peers: Vec<DiscoveredPeer>,
    connected_peer: Option<String>,

    slot: SessionSlot,
    next_session_id: u64,
    listener: Option<TaskGuard>,
    browse: Option<DiscoveryHandle>,
    advertise: Option<DiscoveryHandle>,
    reconnect: Option<OneShotTimer>,
    next_timer_seq: u64,
}

impl NetworkContext {
    fn new(
        discovery: Arc<dyn Discovery>,
        settings: LifecycleSettings,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        io_tx: mpsc::UnboundedSender<IoEvent>,
    ) -> Self {
        Self {
            discovery,
            settings,
            events,
            io_tx,
            machine: StatusMachine::new(),
            generation: 0,
            role: None,
            preferred: None,
            peers: Vec::new(),
            connected_peer: None,
            slot: SessionSlot::Idle,
            next_session_id: 0,
            listener: None,
            browse: None,
            advertise: None,
            reconnect: None,
            next_timer_seq: 0,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut io: mpsc::UnboundedReceiver<IoEvent>,
    ) {
        debug!("network context started");
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(event) = io.recv() => self.handle_io(event),
            }
        }
        debug!("network context stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::StartController { preferred } => self.start_controller(preferred),
            Request::StartFollower { port } => self.start_follower(&port).await,
            Request::SetPreferredPeer(name) => {
                self.preferred = name.filter(|n| !n.is_empty());
            }
            Request::Send(command) => match &self.slot {
                SessionSlot::Ready(session) => session.send(command),
                _ => trace!("no session, dropping {command}"),
            },
            Request::Stop(ack) => {
                self.teardown();
                self.role = None;
                let _ = ack.send(());
            }
        }
    }

    fn handle_io(&mut self, event: IoEvent) {
        match event {
            IoEvent::Snapshot { generation, peers } => {
                if self.is_stale(generation) {
                    debug!("dropping stale snapshot");
                    return;
                }
                self.peers = peers.clone();
                self.emit(ConnectionEvent::PeersChanged(peers));
                self.evaluate_controller();
            }
            IoEvent::BrowseFailed { generation, message } => {
                if self.is_stale(generation) || self.role != Some(Role::Controller) {
                    return;
                }
                warn!("browse failed: {message}");
                self.on_browse_failed(SyncError::Discovery(message));
            }
            IoEvent::Dialed {
                generation,
                session,
                result,
            } => self.on_dialed(generation, session, result),
            IoEvent::Accepted {
                generation,
                stream,
                addr,
            } => self.on_accepted(generation, stream, addr),
            IoEvent::Session {
                generation,
                session,
                event,
            } => self.on_session_event(generation, session, event),
            IoEvent::ReconnectFired { generation, seq } => self.on_reconnect(generation, seq),
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        generation != self.generation
    }

    // ── Start / stop ─────────────────────────────────────────────

    /// Cancel everything and publish the stopped state.
    fn teardown(&mut self) {
        self.generation += 1;
        self.slot = SessionSlot::Idle;
        self.reconnect = None;
        self.listener = None;
        self.browse = None;
        self.advertise = None;
        self.peers.clear();

        self.transition(StatusEvent::Stop);
        self.emit(ConnectionEvent::PeersChanged(Vec::new()));
        self.connected_peer = None;
        self.emit(ConnectionEvent::ConnectedPeerChanged(None));
    }

    fn start_controller(&mut self, preferred: Option<String>) {
        self.teardown();
        self.role = Some(Role::Controller);
        self.preferred = preferred.filter(|n| !n.is_empty());
        info!(
            "starting as controller (preferred peer: {})",
            self.preferred.as_deref().unwrap_or("none")
        );
        self.transition(StatusEvent::StartController);
        self.start_browse();
    }

    /// Browse for the current generation. A failure to start is handled like
    /// a browse that failed later.
    fn start_browse(&mut self) {
        let tx = self.io_tx.clone();
        let generation = self.generation;
        let sink: SnapshotSink = Box::new(move |event: DiscoveryEvent| {
            let event = match event {
                DiscoveryEvent::Snapshot(peers) => IoEvent::Snapshot { generation, peers },
                DiscoveryEvent::Failed(message) => IoEvent::BrowseFailed { generation, message },
            };
            let _ = tx.send(event);
        });
        match self.discovery.browse(sink) {
            Ok(handle) => self.browse = Some(handle),
            Err(e) => {
                warn!("could not start browsing: {e}");
                self.on_browse_failed(e);
            }
        }
    }

    /// Without discovery the peer list and any session built on it are
    /// dropped; the reconnect timer restarts the browse.
    fn on_browse_failed(&mut self, error: SyncError) {
        self.browse = None;
        self.slot = SessionSlot::Idle;
        self.set_connected_peer(None);
        if !self.peers.is_empty() {
            self.peers.clear();
            self.emit(ConnectionEvent::PeersChanged(Vec::new()));
        }
        self.transition(StatusEvent::BrowseFailed(error.failure_reason()));
        self.schedule_reconnect();
    }

    async fn start_follower(&mut self, port_text: &str) {
        self.teardown();
        self.role = Some(Role::Follower);

        let port = match parse_port(port_text) {
            Ok(port) => port,
            Err(e) => {
                warn!("{e}");
                self.transition(StatusEvent::ConfigRejected(e.failure_reason()));
                return;
            }
        };

        let addr = SocketAddr::new(self.settings.listen_address, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let e = SyncError::Bind { port, source };
                warn!("{e}");
                self.transition(StatusEvent::BindFailed(e.failure_reason()));
                return;
            }
        };
        info!("follower listening on {addr}");
        self.transition(StatusEvent::StartFollower);

        let tx = self.io_tx.clone();
        let generation = self.generation;
        self.listener = Some(TaskGuard::spawn("accept", async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if tx.send(IoEvent::Accepted { generation, stream, addr }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("accept error: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }));

        match self.discovery.advertise(&self.settings.instance_name, port) {
            Ok(handle) => self.advertise = Some(handle),
            Err(e) => warn!("could not advertise {}: {e}", self.settings.instance_name),
        }
    }

    // ── Controller ───────────────────────────────────────────────

    /// Dial a peer from the current snapshot if nothing is pending.
    fn evaluate_controller(&mut self) {
        if self.role != Some(Role::Controller) {
            return;
        }
        if !self.slot.is_idle() {
            trace!("session pending or established, not dialing");
            return;
        }
        if *self.machine.status() != ConnectionStatus::Connecting {
            return;
        }
        let Some(peer) = select_peer(&self.peers, self.preferred.as_deref()).cloned() else {
            self.transition(StatusEvent::NoPeerAvailable);
            return;
        };
        self.dial(peer);
    }

    fn dial(&mut self, peer: DiscoveredPeer) {
        self.reconnect = None;
        self.next_session_id += 1;
        let session = self.next_session_id;
        let generation = self.generation;
        let tx = self.io_tx.clone();
        info!("dialing {peer}");

        let name = peer.name().to_string();
        let addr = peer.addr();
        let task = TaskGuard::spawn("dial", async move {
            let result = TcpStream::connect(addr)
                .await
                .map_err(|source| SyncError::Dial { peer: name, source });
            let _ = tx.send(IoEvent::Dialed {
                generation,
                session,
                result,
            });
        });
        self.slot = SessionSlot::Dialing {
            id: session,
            peer_name: peer.name().to_string(),
            _task: task,
        };
    }

    fn on_dialed(&mut self, generation: u64, session: u64, result: Result<TcpStream, SyncError>) {
        let peer_name = match &self.slot {
            SessionSlot::Dialing { id, peer_name, .. }
                if *id == session && !self.is_stale(generation) =>
            {
                peer_name.clone()
            }
            _ => {
                debug!("dropping stale dial result for session {session}");
                return;
            }
        };

        match result {
            Ok(stream) => {
                info!("connected to {peer_name}");
                let sink = self.session_sink(session);
                self.slot = SessionSlot::Ready(Session::start(session, peer_name.clone(), stream, sink));
                self.transition(StatusEvent::DialSucceeded);
                self.set_connected_peer(Some(peer_name));
            }
            Err(e) => {
                warn!("{e}");
                self.slot = SessionSlot::Idle;
                self.transition(StatusEvent::DialFailed(e.failure_reason()));
                self.schedule_reconnect();
            }
        }
    }

    // ── Follower ─────────────────────────────────────────────────

    fn on_accepted(&mut self, generation: u64, stream: TcpStream, addr: SocketAddr) {
        if self.is_stale(generation) || self.role != Some(Role::Follower) {
            debug!("dropping stale connection from {addr}");
            return;
        }
        if let Some(previous) = self.slot.ready_id() {
            info!("replacing session {previous} with a connection from {addr}");
        } else {
            info!("accepted connection from {addr}");
        }
        self.reconnect = None;
        self.next_session_id += 1;
        let session = self.next_session_id;
        let peer_name = addr.to_string();
        let sink = self.session_sink(session);
        self.slot = SessionSlot::Ready(Session::start(session, peer_name.clone(), stream, sink));
        self.transition(StatusEvent::Accepted);
        self.set_connected_peer(Some(peer_name));
    }

    // ── Sessions ─────────────────────────────────────────────────

    fn session_sink(&self, session: u64) -> SessionSink {
        let tx = self.io_tx.clone();
        let generation = self.generation;
        Box::new(move |event: SessionEvent| {
            let _ = tx.send(IoEvent::Session {
                generation,
                session,
                event,
            });
        })
    }

    fn on_session_event(&mut self, generation: u64, session: u64, event: SessionEvent) {
        if self.is_stale(generation) || self.slot.ready_id() != Some(session) {
            debug!("dropping event from stale session {session}");
            return;
        }
        match event {
            SessionEvent::Inbound(command) => {
                self.emit(ConnectionEvent::CommandReceived(command));
            }
            SessionEvent::Closed(reason) => {
                if let SessionSlot::Ready(s) = &self.slot {
                    info!("session with {} ended: {reason}", s.peer_name());
                }
                self.slot = SessionSlot::Idle;
                self.set_connected_peer(None);
                self.transition(StatusEvent::SocketFailed(reason));
                self.schedule_reconnect();
            }
        }
    }

    // ── Reconnect ────────────────────────────────────────────────

    fn schedule_reconnect(&mut self) {
        self.next_timer_seq += 1;
        let seq = self.next_timer_seq;
        let generation = self.generation;
        let tx = self.io_tx.clone();
        debug!("reconnect in {:?}", self.settings.reconnect_delay);
        self.reconnect = Some(OneShotTimer::schedule(
            seq,
            self.settings.reconnect_delay,
            move |seq| {
                let _ = tx.send(IoEvent::ReconnectFired { generation, seq });
            },
        ));
    }

    fn on_reconnect(&mut self, generation: u64, seq: u64) {
        let live = self.reconnect.as_ref().map(|t| t.seq()) == Some(seq);
        if self.is_stale(generation) || !live {
            debug!("dropping stale reconnect timer {seq}");
            return;
        }
        self.reconnect = None;
        if !self.slot.is_idle() {
            return;
        }
        match self.role {
            Some(Role::Controller) => {
                self.transition(StatusEvent::RetryController);
                if self.browse.is_none() {
                    // Snapshots from the new browse drive the next dial.
                    self.start_browse();
                } else {
                    self.evaluate_controller();
                }
            }
            Some(Role::Follower) => self.transition(StatusEvent::RetryFollower),
            None => {}
        }
    }

    // ── Publishing ───────────────────────────────────────────────

    fn transition(&mut self, event: StatusEvent) {
        let is_stop = event == StatusEvent::Stop;
        let previous = self.machine.status().clone();
        match self.machine.apply(event) {
            Ok(status) => {
                if is_stop || *status != previous {
                    let status = status.clone();
                    debug!("status: {previous} -> {status}");
                    self.emit(ConnectionEvent::StatusChanged(status));
                }
            }
            Err(e) => debug!("ignored: {e}"),
        }
    }

    fn set_connected_peer(&mut self, name: Option<String>) {
        if self.connected_peer != name {
            self.connected_peer = name.clone();
            self.emit(ConnectionEvent::ConnectedPeerChanged(name));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            trace!("no one is listening for connection events");
        }
    }
}
