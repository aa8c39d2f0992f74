//! TCP peer links for the mesh: accept/connect, HELLO/BYE handshake,
//! stream reassembly and fixed-delay reconnects.
//!
//! Every node knows the full peer directory up front. A node dials only the
//! peers whose names sort after its own, so each pair ends up with exactly
//! one link. Inbound links stay anonymous until the remote side sends HELLO.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{listen_tcp, MemorySessionStore, Mesh, MeshEvent, MeshOptions, Peer, PeerDirectory};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), mesh_session::MeshError> {
//! let directory = Arc::new(PeerDirectory::new(vec![
//!     Peer::new("a", "127.0.0.1:7001"),
//!     Peer::new("b", "127.0.0.1:7002"),
//! ])?);
//! let store = MemorySessionStore::for_directory(&directory);
//! let (mesh, mut events) = Mesh::new(MeshOptions::new("a"), directory, store);
//!
//! let listener = listen_tcp("127.0.0.1:7001").await?;
//! let acceptor = mesh.clone();
//! tokio::spawn(async move {
//!     while let Ok((stream, _)) = listener.accept().await {
//!         if acceptor.accept(stream).is_err() {
//!             break;
//!         }
//!     }
//! });
//!
//! mesh.connect()?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         MeshEvent::Connected { peer, .. } => println!("connected to {}", peer),
//!         MeshEvent::Message { peer, message } => println!("{} from {}", message.typ, peer.name),
//!         MeshEvent::Disconnected { .. } | MeshEvent::Failed { .. } => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod handshake;
mod manager;
pub mod mesh;
pub mod peer;
pub mod reassembly;
pub mod session;
pub mod transport;

// Re-export main types
pub use connection::{Connection, ConnectionId, ConnectionState, Direction};
pub use error::MeshError;
pub use handshake::{Handshake, HandshakeAction, HandshakeError};
pub use mesh::{
    Mesh, MeshEvent, MeshEvents, MeshHandle, MeshOptions, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RECONNECT_DELAY,
};
pub use peer::{should_initiate, Peer, PeerDirectory};
pub use reassembly::Reassembler;
pub use session::{MemorySessionStore, Session, SessionSnapshot, SessionStore};
pub use transport::{connect_tcp, listen_tcp};

pub use mesh_wire::{Message, MessageType};
