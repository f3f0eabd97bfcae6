//! Local-network peer discovery.
//!
//! A [`Discovery`] backend either advertises this follower under the fixed
//! service identifier or browses for followers. Browsing reports full,
//! normalised snapshots (sorted by name, one entry per id) through a
//! [`SnapshotSink`]; it never reports deltas and never picks a peer.

mod fixed;
mod multicast;

pub use fixed::StaticDiscovery;
pub use multicast::{MulticastConfig, MulticastDiscovery};

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::SyncError;
use crate::task::TaskGuard;

/// Service identifier shared by advertisers and browsers.
pub const SERVICE_TYPE: &str = "_clicksync._tcp";

/// Instance name used when the host name is unavailable.
pub const FALLBACK_INSTANCE_NAME: &str = "ClickSync";

// ── DiscoveredPeer ───────────────────────────────────────────────

/// A follower seen on the network. Identity is the id, which equals the name.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    id: String,
    name: String,
    addr: SocketAddr,
}

impl DiscoveredPeer {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            addr,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl PartialEq for DiscoveredPeer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DiscoveredPeer {}

impl Hash for DiscoveredPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DiscoveredPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

/// Parses `name=ip:port`, the form used for statically configured peers.
impl FromStr for DiscoveredPeer {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, addr) = s
            .split_once('=')
            .ok_or_else(|| SyncError::InvalidConfig(format!("expected name=ip:port, got {s:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidConfig(format!("peer without a name: {s:?}")));
        }
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .map_err(|e| SyncError::InvalidConfig(format!("bad peer address in {s:?}: {e}")))?;
        Ok(Self::new(name, addr))
    }
}

/// Deduplicate by id (later entries win) and sort ascending by name.
pub fn normalize_snapshot<I>(peers: I) -> Vec<DiscoveredPeer>
where
    I: IntoIterator<Item = DiscoveredPeer>,
{
    let mut by_id: HashMap<String, DiscoveredPeer> = HashMap::new();
    for peer in peers {
        by_id.insert(peer.id.clone(), peer);
    }
    let mut snapshot: Vec<DiscoveredPeer> = by_id.into_values().collect();
    snapshot.sort_by(|a, b| a.name.cmp(&b.name));
    snapshot
}

/// The name this host advertises when none is configured.
pub fn default_instance_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_INSTANCE_NAME.to_string())
}

// ── Backend trait ────────────────────────────────────────────────

/// What a browse reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// The complete, normalised set of visible peers.
    Snapshot(Vec<DiscoveredPeer>),
    /// Browsing stopped because of an error.
    Failed(String),
}

/// Callback receiving browse results. Called from the backend's task.
pub type SnapshotSink = Box<dyn Fn(DiscoveryEvent) + Send + Sync + 'static>;

/// A running browse or advertisement. Dropping it stops the activity.
#[derive(Debug, Default)]
pub struct DiscoveryHandle {
    task: Option<TaskGuard>,
}

impl DiscoveryHandle {
    pub fn from_task(task: TaskGuard) -> Self {
        Self { task: Some(task) }
    }

    /// A handle for backends with nothing running in the background.
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Advertise or browse the ClickSync service.
///
/// Both calls must be made from within a tokio runtime.
pub trait Discovery: Send + Sync {
    /// Start browsing; every change to the visible set is sent to `sink`.
    fn browse(&self, sink: SnapshotSink) -> Result<DiscoveryHandle, SyncError>;

    /// Advertise `instance` as reachable on `port`.
    fn advertise(&self, instance: &str, port: u16) -> Result<DiscoveryHandle, SyncError>;
}
