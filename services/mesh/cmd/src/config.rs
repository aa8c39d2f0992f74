//! Configuration handling for the mesh node.
//!
//! Values come from an optional YAML file, then environment variables, then
//! command-line flags, each layer overriding the previous one.

use anyhow::{bail, Context, Result};
use mesh_session::{MeshOptions, Peer, PeerDirectory};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// One entry of the peer list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Node name
    pub name: String,
    /// Address in `host:port` form
    pub address: String,
}

impl From<Peer> for PeerEntry {
    fn from(peer: Peer) -> Self {
        Self {
            name: peer.name,
            address: peer.address,
        }
    }
}

/// Mesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// This node's name; must appear in `peers`
    pub name: String,
    /// Listen address; defaults to this node's own peer address
    pub listen: Option<String>,
    /// Every cluster member, this node included
    pub peers: Vec<PeerEntry>,
    /// Delay before redialling a lost outbound peer (milliseconds)
    pub reconnect_delay_ms: u64,
    /// Outbound connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            listen: None,
            peers: Vec::new(),
            reconnect_delay_ms: 1000,
            connect_timeout_ms: 5000,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    mesh: Option<MeshConfig>,
}

/// Values given on the command line
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub name: Option<String>,
    pub listen: Option<String>,
    pub peers: Vec<Peer>,
    pub reconnect_delay: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl MeshConfig {
    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {:?}", path)),
        };

        let root: RootConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        info!("Loaded configuration from {:?}", path);

        Ok(root.mesh.unwrap_or_default())
    }

    /// Apply environment variable overrides
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("MESH_NAME") {
            info!("Node name overridden by environment: {}", name);
            self.name = name;
        }

        if let Some(listen) = lookup("MESH_LISTEN") {
            info!("Listen address overridden by environment: {}", listen);
            self.listen = Some(listen);
        }

        if let Some(peers) = lookup("MESH_PEERS") {
            self.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<Peer>().map(PeerEntry::from))
                .collect::<Result<_, _>>()
                .context("invalid MESH_PEERS")?;
            info!("Peer list overridden by environment: {} peers", self.peers.len());
        }

        if let Some(delay) = lookup("MESH_RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = delay
                .parse()
                .with_context(|| format!("invalid MESH_RECONNECT_DELAY_MS: {}", delay))?;
            info!(
                "Reconnect delay overridden by environment: {}ms",
                self.reconnect_delay_ms
            );
        }

        if let Some(timeout) = lookup("MESH_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = timeout
                .parse()
                .with_context(|| format!("invalid MESH_CONNECT_TIMEOUT_MS: {}", timeout))?;
            info!(
                "Connect timeout overridden by environment: {}ms",
                self.connect_timeout_ms
            );
        }

        Ok(())
    }

    /// Apply command-line overrides
    pub fn apply_cli_overrides(&mut self, cli: CliOverrides) {
        if let Some(name) = cli.name {
            self.name = name;
        }
        if let Some(listen) = cli.listen {
            self.listen = Some(listen);
        }
        if !cli.peers.is_empty() {
            self.peers = cli.peers.into_iter().map(PeerEntry::from).collect();
        }
        if let Some(delay) = cli.reconnect_delay {
            self.reconnect_delay_ms = delay.as_millis() as u64;
        }
        if let Some(timeout) = cli.connect_timeout {
            self.connect_timeout_ms = timeout.as_millis() as u64;
        }
    }

    /// Check that the configuration describes a runnable node
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("node name is not set (--name, MESH_NAME or mesh.name)");
        }
        if !self.peers.iter().any(|p| p.name == self.name) {
            bail!("node name {} is not in the peer list", self.name);
        }
        if self.reconnect_delay_ms == 0 {
            bail!("reconnect delay must be positive");
        }
        if self.connect_timeout_ms == 0 {
            bail!("connect timeout must be positive");
        }
        self.directory().map(|_| ())
    }

    /// Build the peer directory
    pub fn directory(&self) -> Result<PeerDirectory> {
        let peers = self
            .peers
            .iter()
            .map(|p| Peer::new(p.name.clone(), p.address.clone()));
        Ok(PeerDirectory::new(peers)?)
    }

    /// Address to listen on
    pub fn listen_address(&self) -> Option<String> {
        self.listen.clone().or_else(|| {
            self.peers
                .iter()
                .find(|p| p.name == self.name)
                .map(|p| p.address.clone())
        })
    }

    /// Library options for this node
    pub fn options(&self) -> MeshOptions {
        MeshOptions {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..MeshOptions::new(self.name.clone())
        }
    }
}
