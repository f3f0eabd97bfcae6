//! Role orchestrator: the orchestration context.
//!
//! Composes discovery and the connection lifecycle for the selected role
//! and republishes everything the lifecycle observes as [`SyncEvent`]s on a
//! single channel. On top of that it owns two policies:
//!
//! - **Auto port recovery**: a follower whose port is already in use moves to
//!   the next port, at most [`MAX_PORT_RECOVERIES`] times in a row.
//! - **Preference reset**: a preferred peer that disappears from discovery is
//!   forgotten, so selection falls back to the first peer.
//!
//! Both policies act only on events from the latest start. The lifecycle
//! opens every start and stop with exactly one `Disconnected`, so counting
//! the restarts still in flight tells which events were overtaken.

mod preference;
mod recovery;

pub use preference::PreferredPeer;
pub use recovery::{BASE_PORT, MAX_PORT_RECOVERIES, PortRecovery, next_port};

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveredPeer, Discovery};
use crate::error::SyncError;
use crate::message::{Command, Role};
use crate::network::{ConnectionEvent, ConnectionManager, LifecycleSettings, parse_port};
use crate::state::ConnectionStatus;

/// Default follower port, as text.
pub const DEFAULT_PORT: &str = "54545";

/// What a session is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub role: Role,
    /// Follower listen port as entered by the user.
    pub port: String,
    pub preferred_peer: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            role: Role::Controller,
            port: DEFAULT_PORT.to_string(),
            preferred_peer: None,
        }
    }
}

/// Everything subscribers see, in one total order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    StatusChanged(ConnectionStatus),
    PeersChanged(Vec<DiscoveredPeer>),
    ConnectedPeerChanged(Option<String>),
    CommandReceived(Command),
    /// Auto port recovery moved the follower to a new port.
    PortChanged(u16),
    PreferredPeerChanged(Option<String>),
}

#[derive(Debug)]
enum Request {
    Apply(SessionSettings),
    Stop(oneshot::Sender<()>),
    Send(Command),
    SelectPeer(Option<String>),
    TriggerTest(Command),
}

/// Handle to the orchestration context.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    requests: mpsc::UnboundedSender<Request>,
}

impl Orchestrator {
    /// Spawn the lifecycle and the orchestration context. Nothing starts
    /// until [`Orchestrator::apply`] is called.
    pub fn spawn(
        discovery: Arc<dyn Discovery>,
        lifecycle: LifecycleSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (manager, connection_events) = ConnectionManager::spawn(discovery, lifecycle);
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let ctx = OrchestrationContext {
            manager,
            events,
            settings: SessionSettings::default(),
            active: false,
            status: ConnectionStatus::Disconnected,
            preferred: PreferredPeer::default(),
            recovery: PortRecovery::new(),
            restarts_in_flight: 0,
        };
        tokio::spawn(ctx.run(request_rx, connection_events));

        (Self { requests }, event_rx)
    }

    /// Start per `settings.role`, replacing any running session.
    pub fn apply(&self, settings: SessionSettings) -> Result<(), SyncError> {
        self.requests.send(Request::Apply(settings))?;
        Ok(())
    }

    /// Stop the running session. Returns once the network side is torn down.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let (ack, done) = oneshot::channel();
        self.requests.send(Request::Stop(ack))?;
        done.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Forward a local key press. Ignored unless running as controller.
    pub fn send(&self, command: Command) -> Result<(), SyncError> {
        self.requests.send(Request::Send(command))?;
        Ok(())
    }

    /// Choose the peer to dial; a running controller restarts to honour it.
    pub fn select_peer(&self, name: Option<String>) -> Result<(), SyncError> {
        self.requests.send(Request::SelectPeer(name))?;
        Ok(())
    }

    /// Exercise the pipeline: a controller sends, a follower executes locally.
    pub fn trigger_test(&self, command: Command) -> Result<(), SyncError> {
        self.requests.send(Request::TriggerTest(command))?;
        Ok(())
    }
}

struct OrchestrationContext {
    manager: ConnectionManager,
    events: mpsc::UnboundedSender<SyncEvent>,
    settings: SessionSettings,
    active: bool,
    status: ConnectionStatus,
    preferred: PreferredPeer,
    recovery: PortRecovery,
    /// Start or stop requests whose `Disconnected` has not come back yet.
    restarts_in_flight: u32,
}

impl OrchestrationContext {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut connection: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => {
                        if let Err(e) = self.handle_request(request).await {
                            warn!("orchestrator request failed: {e}");
                        }
                    }
                    None => break,
                },
                event = connection.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_connection_event(event) {
                            warn!("orchestrator could not react: {e}");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("orchestration context stopped");
    }

    async fn handle_request(&mut self, request: Request) -> Result<(), SyncError> {
        match request {
            Request::Apply(settings) => {
                info!("applying settings: {} on port {}", settings.role, settings.port.trim());
                self.preferred.set(settings.preferred_peer.clone());
                self.settings = settings;
                self.active = true;
                self.start()?;
            }
            Request::Stop(ack) => {
                self.active = false;
                self.manager.stop().await?;
                self.restarts_in_flight += 1;
                let _ = ack.send(());
            }
            Request::Send(command) => match self.settings.role {
                Role::Controller if self.active => {
                    debug!("sending {command}");
                    self.manager.send(command)?;
                }
                _ => debug!("not a running controller, ignoring {command}"),
            },
            Request::SelectPeer(name) => {
                self.preferred.set(name);
                self.settings.preferred_peer = self.preferred.name().map(str::to_string);
                self.emit(SyncEvent::PreferredPeerChanged(self.settings.preferred_peer.clone()));
                if self.active && self.settings.role == Role::Controller {
                    self.start()?;
                }
            }
            Request::TriggerTest(command) => match self.settings.role {
                Role::Controller => self.manager.send(command)?,
                Role::Follower => {
                    info!("executing {} (test)", command.display_name());
                    self.emit(SyncEvent::CommandReceived(command));
                }
            },
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), SyncError> {
        match self.settings.role {
            Role::Controller => self
                .manager
                .start_controller(self.preferred.name().map(str::to_string))?,
            Role::Follower => self.start_follower()?,
        }
        self.restarts_in_flight += 1;
        Ok(())
    }

    fn start_follower(&self) -> Result<(), SyncError> {
        self.manager.start_follower(self.settings.port.clone())
    }

    /// True while a newer start or stop is queued behind the event at hand.
    fn is_superseded(&self) -> bool {
        self.restarts_in_flight > 0
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) -> Result<(), SyncError> {
        match event {
            ConnectionEvent::StatusChanged(status) => {
                if status.is_disconnected() && self.is_superseded() {
                    self.restarts_in_flight -= 1;
                }
                self.emit(SyncEvent::StatusChanged(status.clone()));
                if self.is_superseded() {
                    debug!("status {status} belongs to an earlier start");
                    return Ok(());
                }
                self.status = status;
                self.on_status()?;
            }
            ConnectionEvent::PeersChanged(peers) => {
                let reset = !self.is_superseded()
                    && self.settings.role == Role::Controller
                    && !self.status.is_disconnected()
                    && self.preferred.observe(&peers);
                self.emit(SyncEvent::PeersChanged(peers));
                if reset {
                    info!("preferred peer is gone, falling back to the first peer");
                    self.settings.preferred_peer = None;
                    self.emit(SyncEvent::PreferredPeerChanged(None));
                    self.manager.set_preferred_peer(None)?;
                }
            }
            ConnectionEvent::ConnectedPeerChanged(name) => {
                self.emit(SyncEvent::ConnectedPeerChanged(name));
            }
            ConnectionEvent::CommandReceived(command) => {
                if self.settings.role == Role::Follower && !self.is_superseded() {
                    self.emit(SyncEvent::CommandReceived(command));
                } else {
                    debug!("ignoring inbound {command}");
                }
            }
        }
        Ok(())
    }

    fn on_status(&mut self) -> Result<(), SyncError> {
        match &self.status {
            ConnectionStatus::Listening | ConnectionStatus::Connected => self.recovery.reset(),
            ConnectionStatus::Failed(reason)
                if self.active
                    && self.settings.role == Role::Follower
                    && reason.is_port_in_use() =>
            {
                let Ok(current) = parse_port(&self.settings.port) else {
                    return Ok(());
                };
                match self.recovery.rotate(current) {
                    Some(port) => {
                        info!(
                            "port {current} is in use, retrying on {port} ({}/{MAX_PORT_RECOVERIES})",
                            self.recovery.attempts()
                        );
                        self.settings.port = port.to_string();
                        self.emit(SyncEvent::PortChanged(port));
                        self.start_follower()?;
                        self.restarts_in_flight += 1;
                    }
                    None => warn!(
                        "port {current} is in use and {MAX_PORT_RECOVERIES} recoveries are spent"
                    ),
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            debug!("no subscriber for sync events");
        }
    }
}
