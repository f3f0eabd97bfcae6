//! Canonical connection status and the state machine that derives it.
//!
//! Transitions are validated and return `Result` instead of panicking; the
//! lifecycle logs and drops anything the machine rejects.

use std::fmt;

use crate::error::SyncError;

// ── FailureReason ────────────────────────────────────────────────

/// Structured classification of a `Failed` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The follower port is already bound by something else.
    PortInUse,
    /// Any other bind failure.
    Bind,
    /// The controller could not reach the selected peer.
    Dial,
    /// An established session broke or was closed by the peer.
    Socket,
    /// Browsing or advertising failed.
    Discovery,
    /// A configured value was rejected before any I/O happened.
    Config,
}

impl FailureKind {
    fn default_message(&self) -> &'static str {
        match self {
            FailureKind::PortInUse => "Address already in use",
            FailureKind::Bind => "Could not start listener",
            FailureKind::Dial => "Could not connect",
            FailureKind::Socket => "Connection lost",
            FailureKind::Discovery => "Discovery failed",
            FailureKind::Config => "Invalid configuration",
        }
    }
}

/// Why a session failed: a structured kind plus the text shown to users.
///
/// The message is never empty. Port-in-use detection prefers the kind and
/// only falls back to matching the message text, which is the one place a
/// status string carries operational meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    kind: FailureKind,
    message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            kind.default_message().to_string()
        } else {
            message
        };
        Self { kind, message }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this failure means the listen port is occupied.
    pub fn is_port_in_use(&self) -> bool {
        self.kind == FailureKind::PortInUse
            || self
                .message
                .to_ascii_lowercase()
                .contains("address already in use")
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ── ConnectionStatus ─────────────────────────────────────────────

/// The status of the single session a role owns.
///
/// ```text
///  Disconnected ──start(controller)──► Connecting ──dial ok──► Connected
///       │                               │      ▲                   │
///       │ start(follower)     dial error│      │retry  socket error│
///       ▼                               ▼      │                   │
///   Listening ──accept──► Connected    Failed ◄────────────────────┘
///
///   stop: any state ──► Disconnected
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Listening,
    Connected,
    Failed(FailureReason),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Status text for display.
    pub fn status_text(&self) -> String {
        match self {
            Self::Disconnected => "Disconnected".into(),
            Self::Connecting => "Connecting".into(),
            Self::Listening => "Listening".into(),
            Self::Connected => "Connected".into(),
            Self::Failed(reason) => format!("Error: {reason}"),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_text())
    }
}

// ── StatusEvent ──────────────────────────────────────────────────

/// Lifecycle observations fed into the [`StatusMachine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    StartController,
    StartFollower,
    /// A snapshot arrived with nothing to dial.
    NoPeerAvailable,
    DialSucceeded,
    DialFailed(FailureReason),
    BrowseFailed(FailureReason),
    Accepted,
    BindFailed(FailureReason),
    ConfigRejected(FailureReason),
    SocketFailed(FailureReason),
    /// The reconnect timer re-entered the role's waiting state.
    RetryController,
    RetryFollower,
    Stop,
}

impl StatusEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::StartController => "start as controller",
            Self::StartFollower => "start as follower",
            Self::NoPeerAvailable => "snapshot without match",
            Self::DialSucceeded => "dial success",
            Self::DialFailed(_) => "dial error",
            Self::BrowseFailed(_) => "browse error",
            Self::Accepted => "inbound accepted",
            Self::BindFailed(_) => "bind error",
            Self::ConfigRejected(_) => "config error",
            Self::SocketFailed(_) => "socket error",
            Self::RetryController => "controller retry",
            Self::RetryFollower => "follower retry",
            Self::Stop => "stop",
        }
    }
}

// ── StatusMachine ────────────────────────────────────────────────

/// Holds the current [`ConnectionStatus`] and applies validated transitions.
#[derive(Debug, Clone, Default)]
pub struct StatusMachine {
    status: ConnectionStatus,
}

impl StatusMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Apply `event`, returning the new status.
    ///
    /// Rejected events leave the status untouched.
    pub fn apply(&mut self, event: StatusEvent) -> Result<&ConnectionStatus, SyncError> {
        use ConnectionStatus as S;
        use StatusEvent as E;

        let next = match (&self.status, event) {
            (_, E::Stop) => S::Disconnected,

            (S::Disconnected, E::StartController) => S::Connecting,
            (S::Disconnected, E::StartFollower) => S::Listening,
            (S::Disconnected, E::ConfigRejected(r)) => S::Failed(r),

            (S::Connecting, E::NoPeerAvailable) => S::Connecting,
            (S::Connecting, E::DialSucceeded) => S::Connected,
            (S::Connecting, E::DialFailed(r)) => S::Failed(r),
            (S::Connecting | S::Connected | S::Failed(_), E::BrowseFailed(r)) => S::Failed(r),

            (S::Disconnected | S::Listening, E::BindFailed(r)) => S::Failed(r),
            (S::Listening | S::Connected | S::Failed(_), E::Accepted) => S::Connected,

            (S::Connected, E::SocketFailed(r)) => S::Failed(r),

            (S::Failed(_), E::RetryController) => S::Connecting,
            (S::Failed(_), E::RetryFollower) => S::Listening,

            (from, event) => {
                return Err(SyncError::InvalidTransition {
                    from: from.to_string(),
                    event: event.name(),
                });
            }
        };
        self.status = next;
        Ok(&self.status)
    }
}

// ── Tests ────────────────────────────────────────────────────────
