//! TCP transport for mesh connections.
//!
//! A live socket is split into a reader task and a writer task. The reader
//! reports everything it sees to the mesh as [`SocketEvent`]s; the writer
//! drains a command channel. Neither task holds any mesh state.

use crate::connection::{ConnectionId, SocketEvent, WriterCommand};
use crate::error::MeshError;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: &str) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address, giving up after `timeout`
pub async fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream, MeshError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| MeshError::ConnectTimeout {
            addr: addr.to_string(),
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Handles to the I/O tasks of one socket
#[derive(Debug)]
pub(crate) struct SocketIo {
    pub writer: mpsc::UnboundedSender<WriterCommand>,
    pub reader_task: JoinHandle<()>,
    pub writer_task: JoinHandle<()>,
}

/// Split a stream and start its reader and writer tasks
pub(crate) fn spawn_io(
    id: ConnectionId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> SocketIo {
    let (read_half, write_half) = stream.into_split();
    let (writer, commands) = mpsc::unbounded_channel();

    let reader_task = tokio::spawn(read_loop(id, read_half, events.clone()));
    let writer_task = tokio::spawn(write_loop(id, write_half, commands, events));

    SocketIo {
        writer,
        reader_task,
        writer_task,
    }
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Connection {} reached EOF", id);
                let _ = events.send(SocketEvent::End { id });
                return;
            }
            Ok(n) => {
                trace!("Connection {} read {} bytes", id, n);
                SocketEvent::Data {
                    id,
                    bytes: buf.split().freeze(),
                }
            }
            Err(e) => {
                let _ = events.send(SocketEvent::Error {
                    id,
                    error: e.to_string(),
                });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Write(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    let _ = events.send(SocketEvent::Error {
                        id,
                        error: e.to_string(),
                    });
                    return;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }

    // Shutdown requested or every sender dropped: close our half
    if let Err(e) = writer.shutdown().await {
        debug!("Connection {} shutdown failed: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, server) = tokio::join!(
            connect_tcp(&addr, Duration::from_secs(5)),
            listener.accept()
        );
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_reader_reports_data_and_end() {
        let (client, mut server) = pair().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let io = spawn_io(ConnectionId(1), client, events_tx);

        server.write_all(b"hello").await.unwrap();
        server.shutdown().await.unwrap();

        let mut received = Vec::new();
        loop {
            match events_rx.recv().await.unwrap() {
                SocketEvent::Data { id, bytes } => {
                    assert_eq!(id, ConnectionId(1));
                    received.extend_from_slice(&bytes);
                }
                SocketEvent::End { id } => {
                    assert_eq!(id, ConnectionId(1));
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(received, b"hello");
        drop(io);
    }

    #[tokio::test]
    async fn test_writer_flushes_before_shutdown() {
        let (client, mut server) = pair().await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let io = spawn_io(ConnectionId(2), client, events_tx);

        io.writer
            .send(WriterCommand::Write(Bytes::from_static(b"one ")))
            .unwrap();
        io.writer
            .send(WriterCommand::Write(Bytes::from_static(b"two")))
            .unwrap();
        io.writer.send(WriterCommand::Shutdown).unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"one two");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connect_tcp(&addr, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(MeshError::Io(_))));
    }
}
