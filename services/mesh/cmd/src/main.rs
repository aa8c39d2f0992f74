//! Mesh node binary.
//!
//! Runs one member of a full TCP mesh: listens for peers, dials the peers
//! it is responsible for, and logs every link change and received message.

use anyhow::Context;
use clap::Parser;
use mesh_session::{
    listen_tcp, MemorySessionStore, Mesh, MeshEvent, MeshEvents, MeshHandle, Peer,
};
use mesh_wire::TermPayload;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

mod config;
mod logging;

use config::{CliOverrides, MeshConfig};

/// How long shutdown waits for the final events to be logged
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Full-mesh peer node
#[derive(Parser, Debug)]
#[command(name = "redb-mesh", version, about = "Full-mesh TCP peer node")]
struct Args {
    /// This node's name; must be one of the peers
    #[arg(long)]
    name: Option<String>,

    /// Listen address, e.g. 0.0.0.0:7001 (defaults to this node's peer address)
    #[arg(long)]
    listen: Option<String>,

    /// Cluster member as name=host:port (repeatable, include this node)
    #[arg(long = "peer")]
    peers: Vec<Peer>,

    /// Delay before redialling a lost peer, e.g. 1s
    #[arg(long)]
    reconnect_delay: Option<humantime::Duration>,

    /// Outbound connect timeout, e.g. 5s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init("mesh", &args.log_level)?;

    info!("Starting reDB Mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => MeshConfig::load_from_file(path)?,
        None => MeshConfig::default(),
    };
    config.apply_environment_overrides()?;
    config.apply_cli_overrides(CliOverrides {
        name: args.name,
        listen: args.listen,
        peers: args.peers,
        reconnect_delay: args.reconnect_delay.map(Duration::from),
        connect_timeout: args.connect_timeout.map(Duration::from),
    });
    config.validate().context("invalid mesh configuration")?;

    let directory = Arc::new(config.directory()?);
    let listen_addr = config
        .listen_address()
        .context("no listen address configured")?;
    info!(
        "Node {} with {} peers, reconnect_delay={}ms, connect_timeout={}ms",
        config.name,
        directory.len(),
        config.reconnect_delay_ms,
        config.connect_timeout_ms
    );

    let listener = listen_tcp(&listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", listen_addr))?;
    info!("Listening on {}", listen_addr);

    let store = MemorySessionStore::for_directory(&directory);
    let (mesh, mut events) = Mesh::new(config.options(), directory, store);

    let accept_task = tokio::spawn(accept_loop(listener, mesh.clone()));

    mesh.connect()?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    info!("Mesh node started. Waiting for events...");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal, shutting down");
                break;
            }

            _ = sigint.recv() => {
                info!("Received SIGINT signal, shutting down");
                break;
            }

            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => {
                    warn!("Mesh driver stopped unexpectedly");
                    break;
                }
            },
        }
    }

    accept_task.abort();
    shutdown(&mesh, &mut events).await;

    info!("Mesh node stopped");
    Ok(())
}

async fn accept_loop(listener: TcpListener, mesh: MeshHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted TCP connection from {}", addr);
                if mesh.accept(stream).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Say goodbye to every peer, then stop the driver and log what it reported
async fn shutdown(mesh: &MeshHandle, events: &mut MeshEvents) {
    if mesh.disconnect().is_err() || mesh.shutdown().is_err() {
        return;
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    })
    .await;
    if drained.is_err() {
        warn!("Mesh driver did not stop within {:?}", SHUTDOWN_GRACE);
    }
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::Connected { peer, connection } => {
            info!(component = "events", "Peer {} connected on connection {}", peer, connection)
        }
        MeshEvent::Disconnected { peer: Some(peer) } => {
            info!(component = "events", "Peer {} disconnected", peer)
        }
        MeshEvent::Disconnected { peer: None } => {
            debug!(component = "events", "Unidentified connection closed")
        }
        MeshEvent::Failed { peer, reason } => match peer {
            Some(peer) => warn!(component = "events", "Link to {} failed: {}", peer, reason),
            None => warn!(component = "events", "Unidentified connection failed: {}", reason),
        },
        MeshEvent::Message { peer, message } => match message.json::<TermPayload>() {
            Ok(Some(payload)) => info!(
                component = "events",
                "{} from {} (term {})",
                message.typ,
                peer.name,
                payload.term
            ),
            _ => info!(
                component = "events",
                "{} from {}: {}",
                message.typ,
                peer.name,
                message.data.as_deref().unwrap_or("")
            ),
        },
    }
}
