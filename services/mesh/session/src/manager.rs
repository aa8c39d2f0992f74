//! Mesh driver: the single task that owns every connection and session.
//!
//! Commands from [`MeshHandle`](crate::MeshHandle)s, socket events from the
//! per-connection I/O tasks and reconnect timer expiries all arrive over
//! channels and are handled one at a time, so no handler ever observes
//! another one half-way through.

use crate::connection::{Connection, ConnectionId, ConnectionState, Direction, SocketEvent};
use crate::handshake::{Handshake, HandshakeAction, HandshakeError};
use crate::mesh::{Command, MeshEvent, MeshOptions};
use crate::peer::{Peer, PeerDirectory};
use crate::reassembly::Reassembler;
use crate::session::{SessionSnapshot, SessionStore};
use crate::transport::{connect_tcp, spawn_io};
use bytes::{Bytes, BytesMut};
use mesh_wire::{build_bye, build_hello, Message};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Pending reconnection to one peer
#[derive(Debug)]
struct ReconnectTimer {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct TimerFired {
    peer: Arc<Peer>,
    generation: u64,
}

/// Owner of all mesh state
pub(crate) struct MeshDriver<S> {
    options: MeshOptions,
    directory: Arc<PeerDirectory>,
    handshake: Handshake,
    store: S,
    reassembler: Reassembler,
    connections: HashMap<ConnectionId, Connection>,
    next_connection_id: u64,
    reconnects: HashMap<String, ReconnectTimer>,
    next_generation: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<MeshEvent>,
    io_tx: mpsc::UnboundedSender<SocketEvent>,
    io_rx: mpsc::UnboundedReceiver<SocketEvent>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
}

impl<S: SessionStore> MeshDriver<S> {
    pub(crate) fn new(
        options: MeshOptions,
        directory: Arc<PeerDirectory>,
        store: S,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            handshake: Handshake::new(options.node_name.clone(), directory.clone()),
            reassembler: Reassembler::with_max_frame_size(options.max_frame_size),
            options,
            directory,
            store,
            connections: HashMap::new(),
            next_connection_id: 1,
            reconnects: HashMap::new(),
            next_generation: 1,
            commands,
            events,
            io_tx,
            io_rx,
            timer_tx,
            timer_rx,
        }
    }

    /// Run until shutdown is requested or every handle is dropped
    pub(crate) async fn run(mut self) {
        info!("Starting mesh driver for node {}", self.options.node_name);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },

                Some(event) = self.io_rx.recv() => self.handle_socket_event(event),

                Some(fired) = self.timer_rx.recv() => self.handle_timer(fired),
            }
        }

        self.teardown();
        info!("Mesh driver for node {} stopped", self.options.node_name);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Accept(stream) => self.accept(stream),
            Command::Send { peer, message } => self.send(&peer, &message),
            Command::Broadcast(message) => self.broadcast(&message),
            Command::Session { peer, reply } => {
                let snapshot = self.store.get(&peer).map(SessionSnapshot::from);
                let _ = reply.send(snapshot);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Dialed { id, stream } => self.on_dialed(id, stream),
            SocketEvent::Data { id, bytes } => self.on_data(id, bytes),
            SocketEvent::End { id } => self.on_end(id),
            SocketEvent::Error { id, error } => self.on_error(id, error),
        }
    }

    fn emit(&self, event: MeshEvent) {
        // Nobody listening is not an error for the transport
        let _ = self.events.send(event);
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        id
    }

    // ----- connect path -----

    fn connect(&mut self) {
        let candidates: Vec<Arc<Peer>> = self
            .directory
            .candidates(&self.options.node_name)
            .cloned()
            .collect();
        info!(
            "Node {} connecting to {} candidate peers",
            self.options.node_name,
            candidates.len()
        );

        for peer in candidates {
            self.cancel_reconnect(&peer.name);
            self.dial(peer);
        }
    }

    fn is_bound(&self, peer: &str) -> bool {
        self.store.get(peer).map_or(false, |s| s.is_connected())
    }

    fn is_dialing(&self, peer: &str) -> bool {
        self.connections.values().any(|c| {
            c.state == ConnectionState::Connecting
                && c.target.as_deref().map_or(false, |t| t.name == peer)
        })
    }

    fn dial(&mut self, peer: Arc<Peer>) {
        if self.is_bound(&peer.name) || self.is_dialing(&peer.name) {
            debug!("Peer {} already connected or dialing, skipping", peer.name);
            return;
        }

        let id = self.allocate_id();
        info!("Dialing peer {} as connection {}", peer, id);

        let address = peer.address.clone();
        let timeout = self.options.connect_timeout;
        let io_tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            let event = match connect_tcp(&address, timeout).await {
                Ok(stream) => SocketEvent::Dialed { id, stream },
                Err(e) => SocketEvent::Error {
                    id,
                    error: e.to_string(),
                },
            };
            let _ = io_tx.send(event);
        });

        let mut conn = Connection::outbound(id, peer);
        conn.track_dial(task);
        self.connections.insert(id, conn);
    }

    fn on_dialed(&mut self, id: ConnectionId, stream: TcpStream) {
        let hello = match build_hello(&self.options.node_name) {
            Ok(frame) => frame,
            Err(e) => {
                self.on_error(id, format!("failed to encode HELLO: {}", e));
                return;
            }
        };

        let Some(conn) = self.connections.get_mut(&id) else {
            trace!("Dial result for removed connection {}", id);
            return;
        };
        if conn.state != ConnectionState::Connecting {
            return;
        }

        let io = spawn_io(id, stream, self.io_tx.clone());
        conn.attach(io);
        conn.transition_to(ConnectionState::Handshaking);
        conn.send(hello);
        conn.transition_to(ConnectionState::Bound);

        let Some(peer) = conn.peer.clone() else {
            return;
        };
        info!("Connected to peer {} on connection {}", peer, id);
        self.bind_session(&peer, id);
    }

    // ----- accept path -----

    fn accept(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on inbound socket: {}", e);
        }

        let id = self.allocate_id();
        match stream.peer_addr() {
            Ok(addr) => debug!("Accepted connection {} from {}", id, addr),
            Err(_) => debug!("Accepted connection {}", id),
        }

        let io = spawn_io(id, stream, self.io_tx.clone());
        let mut conn = Connection::inbound(id);
        conn.attach(io);
        self.connections.insert(id, conn);
    }

    // ----- data path -----

    fn on_data(&mut self, id: ConnectionId, bytes: Bytes) {
        if !self.is_processing(id) {
            trace!("Dropping {} bytes for connection {}", bytes.len(), id);
            return;
        }

        let mut buffer = self.take_buffer(id);
        buffer.extend_from_slice(&bytes);

        loop {
            let message = match self.reassembler.reassemble(&mut buffer, &[]) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    self.on_error(id, e.to_string());
                    return;
                }
            };

            self.handle_message(id, message);

            if !self.is_processing(id) {
                return;
            }
        }

        self.restore_buffer(id, buffer);
    }

    /// Whether the connection is still live and reading
    fn is_processing(&self, id: ConnectionId) -> bool {
        self.connections
            .get(&id)
            .map_or(false, |c| c.state != ConnectionState::Closing)
    }

    /// Peer whose session buffer a connection reads into, if it is bound
    fn bound_peer(&self, id: ConnectionId) -> Option<Arc<Peer>> {
        self.connections
            .get(&id)
            .filter(|c| c.state == ConnectionState::Bound)
            .and_then(|c| c.peer.clone())
    }

    fn take_buffer(&mut self, id: ConnectionId) -> BytesMut {
        if let Some(peer) = self.bound_peer(id) {
            if let Some(session) = self.store.get_mut(&peer.name) {
                return std::mem::take(&mut session.buffer);
            }
        }
        self.connections
            .get_mut(&id)
            .map(|c| std::mem::take(&mut c.pending))
            .unwrap_or_default()
    }

    fn restore_buffer(&mut self, id: ConnectionId, buffer: BytesMut) {
        if let Some(peer) = self.bound_peer(id) {
            if let Some(session) = self.store.get_mut(&peer.name) {
                session.buffer = buffer;
                return;
            }
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.pending = buffer;
        }
    }

    fn handle_message(&mut self, id: ConnectionId, message: Message) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let bound = self.bound_peer(id);
        let action = self.handshake.evaluate(conn.direction, bound.as_ref(), &message);

        match action {
            HandshakeAction::Bind(peer) => self.bind_inbound(id, peer),
            HandshakeAction::Deliver(peer) => {
                trace!("Connection {} delivered {} from {}", id, message.typ, peer.name);
                self.emit(MeshEvent::Message { peer, message });
            }
            HandshakeAction::Ignore => {
                debug!("Connection {} ignoring {}", id, message.typ);
            }
            HandshakeAction::End(reason) => {
                match reason {
                    HandshakeError::Bye => info!("Connection {} received BYE", id),
                    _ => warn!("Ending connection {}: {}", id, reason),
                }
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.end();
                }
            }
        }
    }

    fn bind_inbound(&mut self, id: ConnectionId, peer: Arc<Peer>) {
        let previous = match self.connections.get_mut(&id) {
            Some(conn) => {
                let previous = conn.peer.replace(peer.clone());
                if conn.state == ConnectionState::Accepted {
                    conn.transition_to(ConnectionState::Handshaking);
                }
                conn.transition_to(ConnectionState::Bound);
                previous
            }
            None => return,
        };

        match previous {
            Some(old) if old.name == peer.name => {
                debug!("Connection {} repeated HELLO from {}", id, peer.name);
                return;
            }
            Some(old) => {
                warn!(
                    "Connection {} rebinding from {} to {}",
                    id, old.name, peer.name
                );
                self.unbind_session(&old, id);
            }
            None => {}
        }

        info!("Accepted peer {} on connection {}", peer, id);
        self.bind_session(&peer, id);
    }

    /// Point a peer's session at a connection and announce it.
    ///
    /// A connection previously bound to the same peer is retired without events.
    fn bind_session(&mut self, peer: &Arc<Peer>, id: ConnectionId) {
        let Some(session) = self.store.get_mut(&peer.name) else {
            error!("No session for peer {}", peer.name);
            self.on_error(id, format!("no session for peer {}", peer.name));
            return;
        };

        let previous = session.socket.replace(id);
        session.buffer.clear();

        if let Some(old_id) = previous.filter(|old| *old != id) {
            if let Some(old) = self.connections.remove(&old_id) {
                warn!(
                    "Peer {} rebound to connection {}, retiring connection {}",
                    peer.name, id, old_id
                );
                old.destroy();
            }
        }

        self.emit(MeshEvent::Connected {
            peer: peer.clone(),
            connection: id,
        });
    }

    fn unbind_session(&mut self, peer: &Peer, id: ConnectionId) {
        if let Some(session) = self.store.get_mut(&peer.name) {
            if session.socket == Some(id) {
                session.socket = None;
                session.buffer.clear();
            }
        }
    }

    // ----- terminal events -----

    fn on_end(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else {
            trace!("End for removed connection {}", id);
            return;
        };
        info!("Connection {} to {} closed", id, conn.peer_name());

        self.emit(MeshEvent::Disconnected {
            peer: conn.peer.clone(),
        });
        if let Some(peer) = &conn.peer {
            self.unbind_session(peer, id);
        }
        let target = outbound_target(&conn);
        conn.release();

        if let Some(peer) = target {
            self.schedule_reconnect(peer);
        }
    }

    fn on_error(&mut self, id: ConnectionId, reason: String) {
        let Some(mut conn) = self.connections.remove(&id) else {
            trace!("Error for removed connection {}: {}", id, reason);
            return;
        };
        warn!("Connection {} to {} failed: {}", id, conn.peer_name(), reason);

        self.emit(MeshEvent::Failed {
            peer: conn.peer.clone(),
            reason,
        });
        conn.end();
        if let Some(peer) = &conn.peer {
            self.unbind_session(peer, id);
        }
        let target = outbound_target(&conn);
        conn.destroy();

        if let Some(peer) = target {
            self.schedule_reconnect(peer);
        }
    }

    // ----- reconnection -----

    fn schedule_reconnect(&mut self, peer: Arc<Peer>) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let delay = self.options.reconnect_delay;
        info!("Reconnecting to {} in {:?}", peer, delay);

        let timer_tx = self.timer_tx.clone();
        let name = peer.name.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(TimerFired { peer, generation });
        });

        if let Some(old) = self.reconnects.insert(name, ReconnectTimer { generation, task }) {
            old.task.abort();
        }
    }

    fn cancel_reconnect(&mut self, peer: &str) {
        if let Some(timer) = self.reconnects.remove(peer) {
            debug!("Cancelled pending reconnect to {}", peer);
            timer.task.abort();
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        match self.reconnects.get(&fired.peer.name) {
            Some(timer) if timer.generation == fired.generation => {
                self.reconnects.remove(&fired.peer.name);
                self.dial(fired.peer);
            }
            _ => trace!("Stale reconnect timer for {}", fired.peer.name),
        }
    }

    // ----- outbound messages -----

    fn send(&mut self, peer: &str, message: &Message) {
        let conn = self
            .store
            .get(peer)
            .and_then(|s| s.socket)
            .and_then(|id| self.connections.get(&id))
            .filter(|c| c.is_bound());
        let Some(conn) = conn else {
            warn!("Dropping {} for {}: not connected", message.typ, peer);
            return;
        };

        match message.encode_with_limit(self.options.max_frame_size) {
            Ok(frame) => {
                if !conn.send(frame) {
                    warn!("Connection {} writer gone, dropping {}", conn.id, message.typ);
                }
            }
            Err(e) => warn!("Failed to encode {} for {}: {}", message.typ, peer, e),
        }
    }

    fn broadcast(&mut self, message: &Message) {
        let peers: Vec<String> = self
            .directory
            .iter()
            .filter(|p| p.name != self.options.node_name && self.is_bound(&p.name))
            .map(|p| p.name.clone())
            .collect();
        debug!("Broadcasting {} to {} peers", message.typ, peers.len());
        for peer in peers {
            self.send(&peer, message);
        }
    }

    // ----- explicit disconnect and shutdown -----

    fn disconnect(&mut self) {
        info!("Node {} disconnecting from all peers", self.options.node_name);

        let timers: Vec<String> = self.reconnects.keys().cloned().collect();
        for peer in timers {
            self.cancel_reconnect(&peer);
        }

        let dialing: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.state == ConnectionState::Connecting)
            .map(|c| c.id)
            .collect();
        for id in dialing {
            if let Some(conn) = self.connections.remove(&id) {
                debug!("Abandoning dial {} to {}", id, conn.peer_name());
                conn.destroy();
            }
        }

        let bye = match build_bye() {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!("Failed to encode BYE: {}", e);
                None
            }
        };

        let peers: Vec<Arc<Peer>> = self
            .directory
            .iter()
            .filter(|p| p.name != self.options.node_name)
            .cloned()
            .collect();
        for peer in peers {
            let Some(id) = self.store.get_mut(&peer.name).and_then(|s| {
                s.buffer.clear();
                s.socket.take()
            }) else {
                continue;
            };

            if let Some(mut conn) = self.connections.remove(&id) {
                // Best effort: the writer is aborted right after, with whatever is still queued
                if let Some(frame) = &bye {
                    if !conn.send(frame.clone()) {
                        warn!("Connection {} writer gone, dropping BYE to {}", id, peer.name);
                    }
                }
                conn.end();
                conn.destroy();
            }
            info!("Disconnected from peer {}", peer);
            self.emit(MeshEvent::Disconnected { peer: Some(peer) });
        }
    }

    fn teardown(&mut self) {
        for (_, timer) in self.reconnects.drain() {
            timer.task.abort();
        }
        for (id, conn) in self.connections.drain() {
            if let Some(peer) = &conn.peer {
                if let Some(session) = self.store.get_mut(&peer.name) {
                    if session.socket == Some(id) {
                        session.socket = None;
                        session.buffer.clear();
                    }
                }
            }
            conn.destroy();
        }
    }
}

fn outbound_target(conn: &Connection) -> Option<Arc<Peer>> {
    match conn.direction {
        Direction::Outbound => conn.target.clone(),
        Direction::Inbound => None,
    }
}
