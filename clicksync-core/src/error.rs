//! Domain-specific error types for ClickSync.
//!
//! All fallible operations return `Result<T, SyncError>`.
//! Transport and configuration errors are never fatal: the lifecycle turns
//! them into a `Failed` status through [`SyncError::failure_reason`].

use thiserror::Error;

use crate::state::{FailureKind, FailureReason};

/// The canonical error type for ClickSync.
#[derive(Debug, Error)]
pub enum SyncError {
    // ── Transport Errors ─────────────────────────────────────────
    /// An outbound connection to a discovered peer could not be opened.
    #[error("could not connect to {peer}: {source}")]
    Dial {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    /// The follower listener could not be bound.
    #[error("could not listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// An established session failed while reading.
    #[error("connection lost: {0}")]
    Socket(String),

    /// Browsing or advertising the discovery service failed.
    #[error("discovery failed: {0}")]
    Discovery(String),

    // ── Configuration Errors ─────────────────────────────────────
    /// The follower port text is not a decimal number in 1..=65535.
    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    /// Any other configuration value that could not be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── State Errors ─────────────────────────────────────────────
    /// A status transition that the state machine does not allow.
    #[error("invalid transition: {event} while {from}")]
    InvalidTransition { from: String, event: &'static str },

    // ── Plumbing ─────────────────────────────────────────────────
    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// The IO layer reported an error outside a session.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Map this error to the reason carried by a `Failed` status.
    ///
    /// Bind errors caused by an occupied port map to
    /// [`FailureKind::PortInUse`], which the orchestrator consumes for auto
    /// port recovery.
    pub fn failure_reason(&self) -> FailureReason {
        let kind = match self {
            SyncError::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse => {
                FailureKind::PortInUse
            }
            SyncError::Bind { .. } => FailureKind::Bind,
            SyncError::Dial { .. } => FailureKind::Dial,
            SyncError::Socket(_) | SyncError::Io(_) => FailureKind::Socket,
            SyncError::Discovery(_) => FailureKind::Discovery,
            SyncError::InvalidPort(_) | SyncError::InvalidConfig(_) => FailureKind::Config,
            SyncError::InvalidTransition { .. } | SyncError::ChannelClosed | SyncError::Other(_) => {
                FailureKind::Socket
            }
        };
        let message = match self {
            SyncError::InvalidPort(_) => "Invalid port".to_string(),
            other => other.to_string(),
        };
        FailureReason::new(kind, message)
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for SyncError {
    fn from(s: String) -> Self {
        SyncError::Other(s)
    }
}

impl From<&str> for SyncError {
    fn from(s: &str) -> Self {
        SyncError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SyncError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SyncError::ChannelClosed
    }
}
