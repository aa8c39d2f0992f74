//! Peer identities and the peer directory.
//!
//! The directory is built once at startup and never changes. Peers are
//! ordered by name, and that order decides which side of every pair dials.

use crate::error::MeshError;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A named cluster member with a known network address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer {
    /// Unique node name
    pub name: String,
    /// Address in `host:port` form
    pub address: String,
}

impl Peer {
    /// Create a new peer
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Parses `name=host:port`
impl FromStr for Peer {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, address) = s
            .split_once('=')
            .ok_or_else(|| MeshError::InvalidPeer(s.to_string()))?;
        let (name, address) = (name.trim(), address.trim());

        let port_ok = address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if name.is_empty() || !port_ok {
            return Err(MeshError::InvalidPeer(s.to_string()));
        }

        Ok(Peer::new(name, address))
    }
}

/// Candidate-selection rule: a node dials only peers whose name sorts after its own
pub fn should_initiate(own_name: &str, other_name: &str) -> bool {
    own_name < other_name
}

/// Ordered, immutable set of known peers keyed by name
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: BTreeMap<String, Arc<Peer>>,
}

impl PeerDirectory {
    /// Build a directory, rejecting duplicate names
    pub fn new(peers: impl IntoIterator<Item = Peer>) -> Result<Self, MeshError> {
        let mut map = BTreeMap::new();
        for peer in peers {
            let name = peer.name.clone();
            if map.insert(name.clone(), Arc::new(peer)).is_some() {
                return Err(MeshError::DuplicatePeer(name));
            }
        }
        Ok(Self { peers: map })
    }

    /// Look up a peer by name
    pub fn get(&self, name: &str) -> Option<&Arc<Peer>> {
        self.peers.get(name)
    }

    /// All peers in name order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.peers.values()
    }

    /// Peers this node is responsible for dialling
    pub fn candidates<'a>(&'a self, own_name: &'a str) -> impl Iterator<Item = &'a Arc<Peer>> + 'a {
        self.peers
            .values()
            .filter(move |peer| should_initiate(own_name, &peer.name))
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the directory is empty
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
