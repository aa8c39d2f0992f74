//! Error types for the mesh session layer.

use thiserror::Error;

/// Mesh session errors
#[derive(Error, Debug)]
pub enum MeshError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] mesh_wire::WireError),

    /// Outbound dial did not complete in time
    #[error("connect to {addr} timed out")]
    ConnectTimeout {
        /// Address that was dialled
        addr: String,
    },

    /// The same peer name appears twice in the directory
    #[error("duplicate peer: {0}")]
    DuplicatePeer(String),

    /// Peer string is not `name=host:port`
    #[error("invalid peer {0}, expected name=host:port")]
    InvalidPeer(String),

    /// The mesh driver task is no longer running
    #[error("mesh driver stopped")]
    Stopped,
}
