//! Discovery over a fixed, programmatically updated peer set.
//!
//! Used for statically configured followers (networks that drop multicast)
//! and as a deterministic backend in tests.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::{
    DiscoveredPeer, Discovery, DiscoveryEvent, DiscoveryHandle, SnapshotSink, normalize_snapshot,
};
use crate::error::SyncError;
use crate::task::TaskGuard;

/// Peers come from [`StaticDiscovery::publish`] rather than the network.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    peers: Arc<watch::Sender<Vec<DiscoveredPeer>>>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<DiscoveredPeer>) -> Self {
        let (tx, _rx) = watch::channel(normalize_snapshot(peers));
        Self { peers: Arc::new(tx) }
    }

    /// Replace the peer set. Every active browse reports it, even when it
    /// equals the previous one.
    pub fn publish(&self, peers: Vec<DiscoveredPeer>) {
        self.peers.send_replace(normalize_snapshot(peers));
    }

    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.borrow().clone()
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Discovery for StaticDiscovery {
    fn browse(&self, sink: SnapshotSink) -> Result<DiscoveryHandle, SyncError> {
        let mut rx = self.peers.subscribe();
        let task = TaskGuard::spawn("static-browse", async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                sink(DiscoveryEvent::Snapshot(snapshot));
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        Ok(DiscoveryHandle::from_task(task))
    }

    fn advertise(&self, instance: &str, port: u16) -> Result<DiscoveryHandle, SyncError> {
        debug!("static discovery: not advertising {instance} on port {port}");
        Ok(DiscoveryHandle::idle())
    }
}
