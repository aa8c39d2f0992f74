//! Mesh facade: the handle applications use and the events they receive.

use crate::connection::ConnectionId;
use crate::error::MeshError;
use crate::manager::MeshDriver;
use crate::peer::{Peer, PeerDirectory};
use crate::session::{SessionSnapshot, SessionStore};
use mesh_wire::{Message, MAX_FRAME_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Default delay before redialling a lost outbound peer
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Mesh configuration
#[derive(Debug, Clone)]
pub struct MeshOptions {
    /// This node's name; must match its entry in the peer directory
    pub node_name: String,
    /// Fixed delay before a lost outbound connection is redialled
    pub reconnect_delay: Duration,
    /// Timeout for outbound dials
    pub connect_timeout: Duration,
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl MeshOptions {
    /// Options for `node_name` with everything else defaulted
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }
}

/// Notifications emitted by the mesh
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A connection completed its handshake and is bound to `peer`
    Connected {
        /// Peer now reachable
        peer: Arc<Peer>,
        /// Connection bound to it
        connection: ConnectionId,
    },
    /// A connection ended gracefully
    Disconnected {
        /// Peer it was bound to, if the handshake had completed
        peer: Option<Arc<Peer>>,
    },
    /// A connection failed
    Failed {
        /// Peer it was bound to or dialled for
        peer: Option<Arc<Peer>>,
        /// What went wrong
        reason: String,
    },
    /// An application message arrived from a bound peer
    Message {
        /// Sender
        peer: Arc<Peer>,
        /// Decoded message
        message: Message,
    },
}

/// Stream of mesh events
pub type MeshEvents = mpsc::UnboundedReceiver<MeshEvent>;

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Accept(TcpStream),
    Send { peer: String, message: Message },
    Broadcast(Message),
    Session {
        peer: String,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Shutdown,
}

/// Entry point for starting a mesh
pub struct Mesh;

impl Mesh {
    /// Spawn the mesh driver.
    ///
    /// Must be called inside a tokio runtime. The driver runs until
    /// [`MeshHandle::shutdown`] is called or every handle is dropped.
    pub fn new<S: SessionStore>(
        options: MeshOptions,
        directory: Arc<PeerDirectory>,
        store: S,
    ) -> (MeshHandle, MeshEvents) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = MeshDriver::new(options, directory, store, commands_rx, events_tx);
        tokio::spawn(driver.run());

        (
            MeshHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }
}

/// Cloneable handle to a running mesh
#[derive(Debug, Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl MeshHandle {
    fn post(&self, command: Command) -> Result<(), MeshError> {
        self.commands.send(command).map_err(|_| MeshError::Stopped)
    }

    /// Dial every peer whose name sorts after this node's
    pub fn connect(&self) -> Result<(), MeshError> {
        self.post(Command::Connect)
    }

    /// Gracefully close every bound peer connection without reconnecting
    pub fn disconnect(&self) -> Result<(), MeshError> {
        self.post(Command::Disconnect)
    }

    /// Hand an accepted socket to the mesh
    pub fn accept(&self, stream: TcpStream) -> Result<(), MeshError> {
        self.post(Command::Accept(stream))
    }

    /// Send a message to one peer. Dropped if the peer is not connected.
    pub fn send(&self, peer: impl Into<String>, message: Message) -> Result<(), MeshError> {
        self.post(Command::Send {
            peer: peer.into(),
            message,
        })
    }

    /// Send a message to every connected peer
    pub fn broadcast(&self, message: Message) -> Result<(), MeshError> {
        self.post(Command::Broadcast(message))
    }

    /// Stop the driver, tearing down every connection without events
    pub fn shutdown(&self) -> Result<(), MeshError> {
        self.post(Command::Shutdown)
    }

    /// Snapshot of a peer's session
    pub async fn session(&self, peer: impl Into<String>) -> Result<Option<SessionSnapshot>, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Session {
            peer: peer.into(),
            reply,
        })?;
        rx.await.map_err(|_| MeshError::Stopped)
    }
}
