//! Console agent.
//!
//! Stands in for the desktop pieces around the core: stdin lines act as
//! the key monitor on a controller, and received commands are logged where
//! a follower would synthesise the slide key.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use clicksync_core::{Command, Orchestrator, Role, SessionSettings, SyncError, SyncEvent};

/// One line of console input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    Quit,
}

/// Map a console line to an input. Blank or unknown lines are `None`.
pub fn parse_input(line: &str) -> Option<Input> {
    match line.trim().to_ascii_lowercase().as_str() {
        "n" | "next" | "→" => Some(Input::Command(Command::Next)),
        "p" | "prev" | "previous" | "←" => Some(Input::Command(Command::Previous)),
        "q" | "quit" => Some(Input::Quit),
        _ => None,
    }
}

/// Runs the orchestrator until Ctrl-C or `quit`.
pub struct Agent {
    orchestrator: Orchestrator,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    settings: SessionSettings,
}

impl Agent {
    pub fn new(
        orchestrator: Orchestrator,
        events: mpsc::UnboundedReceiver<SyncEvent>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            orchestrator,
            events,
            settings,
        }
    }

    /// Start the session and pump events and console input.
    pub async fn run(mut self) -> Result<(), SyncError> {
        self.orchestrator.apply(self.settings.clone())?;
        match self.settings.role {
            Role::Controller => info!("type n (next), p (previous) or q (quit)"),
            Role::Follower => info!("waiting for a controller; n/p run a local test, q quits"),
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => match parse_input(&line) {
                        Some(Input::Command(command)) => self.on_command(command)?,
                        Some(Input::Quit) => break,
                        None if line.trim().is_empty() => {}
                        None => warn!("unknown input {:?}", line.trim()),
                    },
                    Ok(None) => {
                        debug!("stdin closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("stdin error: {e}");
                        stdin_open = false;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, shutting down");
                    break;
                }
            }
        }

        self.orchestrator.stop().await?;
        info!("stopped");
        Ok(())
    }

    fn on_command(&self, command: Command) -> Result<(), SyncError> {
        match self.settings.role {
            Role::Controller => {
                info!("sending {}", command.display_name());
                self.orchestrator.send(command)
            }
            Role::Follower => self.orchestrator.trigger_test(command),
        }
    }

    fn on_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::StatusChanged(status) => info!("status: {status}"),
            SyncEvent::PeersChanged(peers) => {
                let names: Vec<&str> = peers.iter().map(|p| p.name()).collect();
                info!("peers: [{}]", names.join(", "));
            }
            SyncEvent::ConnectedPeerChanged(Some(name)) => info!("connected peer: {name}"),
            SyncEvent::ConnectedPeerChanged(None) => debug!("no connected peer"),
            SyncEvent::CommandReceived(command) => {
                info!("executing {}", command.display_name());
            }
            SyncEvent::PortChanged(port) => {
                self.settings.port = port.to_string();
                info!("now listening on port {port}; set [session] port to keep it");
            }
            SyncEvent::PreferredPeerChanged(name) => {
                self.settings.preferred_peer = name.clone();
                match name {
                    Some(name) => info!("preferred peer: {name}"),
                    None => info!("preferred peer cleared"),
                }
            }
        }
    }
}
