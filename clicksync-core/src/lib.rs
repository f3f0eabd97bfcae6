//! # clicksync-core
//!
//! Connection management for ClickSync slide remotes: a controller
//! discovers a follower on the local network, dials it, and sends `NEXT` /
//! `PREV` lines that the follower turns into slide changes.
//!
//! This crate contains:
//! - **Codec**: `LineCodec` plus pure `encode`/`decode` for the line protocol
//! - **Discovery**: the `Discovery` trait, multicast beacons, and a static peer set
//! - **Network**: `ConnectionManager`, the single-task connection lifecycle
//! - **Orchestrator**: role composition, auto port recovery, and preference reset
//! - **State**: `ConnectionStatus` and its validated `StatusMachine`
//! - **Task**: abort-on-drop task handles and a single-shot timer
//! - **Error**: `SyncError`, a `thiserror`-based error hierarchy

pub mod codec;
pub mod discovery;
pub mod error;
pub mod message;
pub mod network;
pub mod orchestrator;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{LineCodec, MAX_LINE_LENGTH};
pub use discovery::{
    DiscoveredPeer, Discovery, DiscoveryEvent, DiscoveryHandle, MulticastConfig,
    MulticastDiscovery, SERVICE_TYPE, StaticDiscovery,
};
pub use error::SyncError;
pub use message::{Command, Message, Role};
pub use network::{ConnectionEvent, ConnectionManager, LifecycleSettings};
pub use orchestrator::{Orchestrator, SessionSettings, SyncEvent};
pub use state::{ConnectionStatus, FailureKind, FailureReason, StatusMachine};
pub use task::{OneShotTimer, TaskGuard};
