//! Configuration for the ClickSync agent.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use clicksync_core::discovery::default_instance_name;
use clicksync_core::orchestrator::DEFAULT_PORT;
use clicksync_core::{
    DiscoveredPeer, Discovery, LifecycleSettings, MulticastConfig, MulticastDiscovery, Role,
    SessionSettings, StaticDiscovery, SyncError,
};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickSyncConfig {
    /// Role, port and peer selection.
    pub session: SessionConfig,
    /// How followers are found.
    pub discovery: DiscoveryConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// "controller" or "follower".
    pub role: Role,
    /// Follower listen port, kept as entered.
    pub port: String,
    /// Peer the controller dials first. Empty for none.
    pub preferred_peer: String,
    /// Address the follower binds to.
    pub listen_address: String,
    /// Delay before a dropped session is retried.
    pub reconnect_delay_ms: u64,
}

/// Discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Advertised name. Empty uses the host name.
    pub instance_name: String,
    /// Multicast group for beacons.
    pub group: String,
    /// UDP port for beacons.
    pub port: u16,
    pub beacon_interval_ms: u64,
    /// Peers silent for this long are dropped.
    pub peer_timeout_ms: u64,
    /// Fixed followers as `name=ip:port`. When set, multicast is not used.
    pub static_peers: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::Controller,
            port: DEFAULT_PORT.into(),
            preferred_peer: String::new(),
            listen_address: Ipv4Addr::UNSPECIFIED.to_string(),
            reconnect_delay_ms: 1000,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let multicast = MulticastConfig::default();
        Self {
            instance_name: String::new(),
            group: multicast.group.to_string(),
            port: multicast.port,
            beacon_interval_ms: multicast.beacon_interval.as_millis() as u64,
            peer_timeout_ms: multicast.peer_timeout.as_millis() as u64,
            static_peers: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClickSyncConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Command-line values win over the file.
    pub fn apply_overrides(&mut self, role: Option<Role>, port: Option<String>, peer: Option<String>) {
        if let Some(role) = role {
            self.session.role = role;
        }
        if let Some(port) = port {
            self.session.port = port;
        }
        if let Some(peer) = peer {
            self.session.preferred_peer = peer;
        }
    }

    /// What the orchestrator starts with.
    pub fn session_settings(&self) -> SessionSettings {
        let preferred = self.session.preferred_peer.trim();
        SessionSettings {
            role: self.session.role,
            port: self.session.port.clone(),
            preferred_peer: (!preferred.is_empty()).then(|| preferred.to_string()),
        }
    }

    pub fn lifecycle_settings(&self) -> Result<LifecycleSettings, SyncError> {
        let listen_address: IpAddr = self.session.listen_address.trim().parse().map_err(|e| {
            SyncError::InvalidConfig(format!(
                "listen_address {:?}: {e}",
                self.session.listen_address
            ))
        })?;
        let instance_name = match self.discovery.instance_name.trim() {
            "" => default_instance_name(),
            name => name.to_string(),
        };
        Ok(LifecycleSettings {
            instance_name,
            listen_address,
            reconnect_delay: Duration::from_millis(self.session.reconnect_delay_ms),
        })
    }

    /// Static peers if any are configured, multicast beacons otherwise.
    pub fn discovery(&self) -> Result<Arc<dyn Discovery>, SyncError> {
        if !self.discovery.static_peers.is_empty() {
            let peers = self
                .discovery
                .static_peers
                .iter()
                .map(|entry| entry.parse::<DiscoveredPeer>())
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Arc::new(StaticDiscovery::new(peers)));
        }

        let group: Ipv4Addr = self.discovery.group.trim().parse().map_err(|e| {
            SyncError::InvalidConfig(format!("group {:?}: {e}", self.discovery.group))
        })?;
        if !group.is_multicast() {
            return Err(SyncError::InvalidConfig(format!("{group} is not a multicast group")));
        }
        Ok(Arc::new(MulticastDiscovery::new(MulticastConfig {
            group,
            port: self.discovery.port,
            beacon_interval: Duration::from_millis(self.discovery.beacon_interval_ms.max(100)),
            peer_timeout: Duration::from_millis(self.discovery.peer_timeout_ms.max(100)),
        })))
    }
}

// ── Tests ────────────────────────────────────────────────────────
