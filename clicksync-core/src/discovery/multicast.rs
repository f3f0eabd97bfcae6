//! LAN discovery over UDP multicast beacons.
//!
//! Followers send a small JSON beacon to the multicast group every beacon
//! interval. Controllers join the group, keep the latest address per
//! instance name, and drop names that go quiet for longer than the peer
//! timeout.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use super::{
    DiscoveredPeer, Discovery, DiscoveryEvent, DiscoveryHandle, SERVICE_TYPE, SnapshotSink,
    normalize_snapshot,
};
use crate::error::SyncError;
use crate::task::TaskGuard;

const MAX_BEACON_SIZE: usize = 2048;

// ── Config ───────────────────────────────────────────────────────

/// Multicast group, port and timing.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub beacon_interval: Duration,
    /// A peer is dropped if no beacon arrives for this long.
    pub peer_timeout: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 54, 54),
            port: 54544,
            beacon_interval: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(8),
        }
    }
}

// ── Beacon ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    service: String,
    name: String,
    port: u16,
}

impl Beacon {
    fn new(name: &str, port: u16) -> Self {
        Self {
            service: SERVICE_TYPE.to_string(),
            name: name.to_string(),
            port,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(|e| SyncError::Discovery(e.to_string()))
    }

    /// Parse a datagram; anything that is not a ClickSync beacon is `None`.
    fn parse(bytes: &[u8]) -> Option<Self> {
        let beacon: Beacon = serde_json::from_slice(bytes).ok()?;
        (beacon.service == SERVICE_TYPE && !beacon.name.is_empty() && beacon.port != 0)
            .then_some(beacon)
    }
}

// ── Peer table ───────────────────────────────────────────────────

struct PeerState {
    addr: SocketAddr,
    last_seen: Instant,
}

#[derive(Default)]
struct PeerTable {
    peers: HashMap<String, PeerState>,
}

impl PeerTable {
    /// Record a beacon. Returns `true` when the visible set changed.
    fn observe(&mut self, name: String, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.insert(name, PeerState { addr, last_seen: now }) {
            None => true,
            Some(prev) => prev.addr != addr,
        }
    }

    /// Drop quiet peers. Returns `true` when any were removed.
    fn evict(&mut self, timeout: Duration, now: Instant) -> bool {
        let before = self.peers.len();
        self.peers
            .retain(|_, s| now.saturating_duration_since(s.last_seen) < timeout);
        self.peers.len() != before
    }

    fn snapshot(&self) -> Vec<DiscoveredPeer> {
        normalize_snapshot(
            self.peers
                .iter()
                .map(|(name, s)| DiscoveredPeer::new(name.clone(), s.addr)),
        )
    }
}

// ── Backend ──────────────────────────────────────────────────────

/// The group membership on the beacon port, bound once and shared by every
/// browse of a backend.
type SharedSocket = Arc<Mutex<Option<Arc<UdpSocket>>>>;

/// Beacon-based [`Discovery`].
///
/// The browse socket outlives individual browses: a restarted browse reuses
/// it, so it never races the previous browse task for the beacon port.
#[derive(Debug, Clone, Default)]
pub struct MulticastDiscovery {
    config: MulticastConfig,
    browse_socket: SharedSocket,
}

impl MulticastDiscovery {
    pub fn new(config: MulticastConfig) -> Self {
        Self {
            config,
            browse_socket: SharedSocket::default(),
        }
    }

    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }

    fn browse_socket(&self) -> Result<Arc<UdpSocket>, SyncError> {
        let mut slot = self
            .browse_socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = slot.as_ref() {
            return Ok(Arc::clone(socket));
        }

        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.port))
            .map_err(|e| SyncError::Discovery(format!("bind {}: {e}", self.config.port)))?;
        std_sock
            .join_multicast_v4(&self.config.group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| SyncError::Discovery(format!("join {}: {e}", self.config.group)))?;
        std_sock.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_sock)?);
        *slot = Some(Arc::clone(&socket));
        Ok(socket)
    }

    fn advertise_socket(&self) -> Result<UdpSocket, SyncError> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_multicast_loop_v4(true)?;
        std_sock.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(std_sock)?)
    }
}

impl Discovery for MulticastDiscovery {
    fn browse(&self, sink: SnapshotSink) -> Result<DiscoveryHandle, SyncError> {
        let socket = self.browse_socket()?;
        info!(
            "browsing for {SERVICE_TYPE} on {}:{}",
            self.config.group, self.config.port
        );
        let shared = Arc::clone(&self.browse_socket);
        let timeout = self.config.peer_timeout;
        let sweep_every = self.config.beacon_interval;
        let task = TaskGuard::spawn("multicast-browse", async move {
            if browse_loop(&socket, timeout, sweep_every, &sink).await.is_err() {
                // A broken socket is rebound by the next browse.
                let mut slot = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &socket)) {
                    *slot = None;
                }
            }
        });
        Ok(DiscoveryHandle::from_task(task))
    }

    fn advertise(&self, instance: &str, port: u16) -> Result<DiscoveryHandle, SyncError> {
        let socket = Arc::new(self.advertise_socket()?);
        let frame = Beacon::new(instance, port).encode()?;
        let dest = SocketAddrV4::new(self.config.group, self.config.port);
        let every = self.config.beacon_interval;
        info!("advertising {instance:?} ({SERVICE_TYPE}) for port {port}");
        let task = TaskGuard::spawn("multicast-advertise", async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = socket.send_to(&frame, dest).await {
                    debug!("beacon send failed: {e}");
                }
            }
        });
        Ok(DiscoveryHandle::from_task(task))
    }
}

/// Runs until the socket fails; the error has already been reported to `sink`.
async fn browse_loop(
    socket: &UdpSocket,
    timeout: Duration,
    sweep_every: Duration,
    sink: &SnapshotSink,
) -> Result<(), SyncError> {
    let mut table = PeerTable::default();
    let mut buf = vec![0u8; MAX_BEACON_SIZE];
    let mut sweep = tokio::time::interval(sweep_every);

    // An empty set is a valid first result.
    sink(DiscoveryEvent::Snapshot(Vec::new()));

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("discovery socket error: {e}");
                        sink(DiscoveryEvent::Failed(e.to_string()));
                        return Err(SyncError::Discovery(e.to_string()));
                    }
                };
                let Some(beacon) = Beacon::parse(&buf[..n]) else {
                    trace!("ignoring datagram from {from}");
                    continue;
                };
                let addr = SocketAddr::new(from.ip(), beacon.port);
                if table.observe(beacon.name, addr, Instant::now()) {
                    sink(DiscoveryEvent::Snapshot(table.snapshot()));
                }
            }
            _ = sweep.tick() => {
                if table.evict(timeout, Instant::now()) {
                    sink(DiscoveryEvent::Snapshot(table.snapshot()));
                }
            }
        }
    }
}
