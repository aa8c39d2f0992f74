//! Connection records and their lifecycle states.
//!
//! Every socket the mesh knows about, inbound or outbound, live or dialling,
//! has one `Connection` in the mesh's connection table. Removing the record
//! is how a connection returns to idle: events that arrive later for its id
//! find nothing and are dropped.

use crate::peer::Peer;
use crate::transport::SocketIo;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identifier of one socket over its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted from a remote peer
    Inbound,
    /// Dialled by this node
    Outbound,
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound dial in progress
    Connecting,
    /// Inbound socket registered, nothing received yet
    Accepted,
    /// Waiting for (inbound) or sending (outbound) HELLO
    Handshaking,
    /// Bound to a peer
    Bound,
    /// Ended locally; waiting for the remote side to close
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Accepted => write!(f, "accepted"),
            ConnectionState::Handshaking => write!(f, "handshaking"),
            ConnectionState::Bound => write!(f, "bound"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Instruction for a connection's writer task
#[derive(Debug)]
pub(crate) enum WriterCommand {
    /// Write an encoded frame
    Write(Bytes),
    /// Flush pending writes and shut down the write half
    Shutdown,
}

/// Socket activity reported to the mesh by I/O tasks
#[derive(Debug)]
pub(crate) enum SocketEvent {
    /// Outbound dial completed
    Dialed {
        id: ConnectionId,
        stream: tokio::net::TcpStream,
    },
    /// Bytes read from the socket
    Data { id: ConnectionId, bytes: Bytes },
    /// Remote side closed the stream
    End { id: ConnectionId },
    /// Dial, read or write failed
    Error { id: ConnectionId, error: String },
}

/// One socket tracked by the mesh
#[derive(Debug)]
pub struct Connection {
    /// Connection ID
    pub id: ConnectionId,
    /// Which side opened it
    pub direction: Direction,
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Peer this socket is bound to; absent until the handshake completes
    pub peer: Option<Arc<Peer>>,
    /// Peer an outbound connection was dialled for; used for reconnects
    pub(crate) target: Option<Arc<Peer>>,
    /// Undecoded bytes received before the socket was bound to a session
    pub(crate) pending: BytesMut,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    dial_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Register an accepted socket
    pub(crate) fn inbound(id: ConnectionId) -> Self {
        Self {
            id,
            direction: Direction::Inbound,
            state: ConnectionState::Accepted,
            peer: None,
            target: None,
            pending: BytesMut::new(),
            writer: None,
            dial_task: None,
            reader_task: None,
            writer_task: None,
        }
    }

    /// Register an outbound dial; the peer is known up front
    pub(crate) fn outbound(id: ConnectionId, peer: Arc<Peer>) -> Self {
        Self {
            id,
            direction: Direction::Outbound,
            state: ConnectionState::Connecting,
            peer: Some(peer.clone()),
            target: Some(peer),
            pending: BytesMut::new(),
            writer: None,
            dial_task: None,
            reader_task: None,
            writer_task: None,
        }
    }

    /// Attach the writer channel and I/O tasks once the socket is live
    pub(crate) fn attach(&mut self, io: SocketIo) {
        self.writer = Some(io.writer);
        self.reader_task = Some(io.reader_task);
        self.writer_task = Some(io.writer_task);
        self.dial_task = None;
    }

    /// Track the dial attempt for an outbound connection
    pub(crate) fn track_dial(&mut self, task: JoinHandle<()>) {
        self.dial_task = Some(task);
    }

    /// Transition to a new state
    pub(crate) fn transition_to(&mut self, new_state: ConnectionState) {
        debug!(
            "Connection {} state transition {} -> {}",
            self.id, self.state, new_state
        );
        self.state = new_state;
    }

    /// Whether application messages may be written
    pub fn is_bound(&self) -> bool {
        self.state == ConnectionState::Bound
    }

    /// Name of the bound peer, for logging
    pub fn peer_name(&self) -> &str {
        self.peer.as_deref().map_or("<unbound>", |p| p.name.as_str())
    }

    /// Queue an encoded frame. Returns false if the writer is gone.
    pub(crate) fn send(&self, frame: Bytes) -> bool {
        match &self.writer {
            Some(writer) => writer.send(WriterCommand::Write(frame)).is_ok(),
            None => false,
        }
    }

    /// Gracefully end the socket: queued writes are flushed, then the write half closes
    pub(crate) fn end(&mut self) {
        if let Some(writer) = &self.writer {
            let _ = writer.send(WriterCommand::Shutdown);
        }
        if self.state != ConnectionState::Closing {
            self.transition_to(ConnectionState::Closing);
        }
    }

    /// Stop reading from the socket but let the writer finish what is queued
    pub(crate) fn release(mut self) {
        // Dropping the last sender lets the writer drain and shut down on its own
        self.writer = None;
        self.writer_task = None;
        for task in [self.dial_task.take(), self.reader_task.take()].into_iter().flatten() {
            task.abort();
        }
    }

    /// Tear the socket down immediately, dropping any queued I/O
    pub(crate) fn destroy(mut self) {
        self.writer = None;
        let tasks = [
            self.dial_task.take(),
            self.reader_task.take(),
            self.writer_task.take(),
        ];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }
}
