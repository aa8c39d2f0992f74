//! End-to-end mesh behaviour over loopback sockets.

use bytes::BytesMut;
use mesh_session::{
    listen_tcp, MemorySessionStore, Mesh, MeshEvent, MeshEvents, MeshHandle, MeshOptions, Peer,
    PeerDirectory,
};
use mesh_wire::{Message, MessageDecoder, MessageType};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn bind() -> (TcpListener, String) {
    let listener = listen_tcp("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Start a mesh node that accepts everything arriving on `listener`
fn start_node(
    name: &str,
    directory: &Arc<PeerDirectory>,
    listener: TcpListener,
    reconnect_delay: Duration,
) -> (MeshHandle, MeshEvents) {
    let options = MeshOptions {
        reconnect_delay,
        ..MeshOptions::new(name)
    };
    let store = MemorySessionStore::for_directory(directory);
    let (mesh, events) = Mesh::new(options, directory.clone(), store);

    let acceptor = mesh.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if acceptor.accept(stream).is_err() {
                break;
            }
        }
    });

    (mesh, events)
}

async fn next_event(events: &mut MeshEvents) -> MeshEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for mesh event")
        .expect("mesh event stream closed")
}

async fn assert_quiet(events: &mut MeshEvents, window: Duration) {
    if let Ok(event) = timeout(window, events.recv()).await {
        panic!("unexpected event {:?}", event);
    }
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut decoder = MessageDecoder::new();
    let mut buf = BytesMut::new();
    loop {
        if let Some(message) = decoder.decode(&mut buf).unwrap() {
            return message;
        }
        let n = timeout(EVENT_TIMEOUT, stream.read_buf(&mut buf))
            .await
            .expect("timed out reading")
            .unwrap();
        assert!(n > 0, "EOF before a complete message");
    }
}

fn encode(message: Message) -> Vec<u8> {
    message.encode().unwrap().to_vec()
}

fn peer_name(peer: &Option<Arc<Peer>>) -> Option<&str> {
    peer.as_deref().map(|p| p.name.as_str())
}

#[tokio::test]
async fn test_hello_then_election_in_separate_writes() {
    let (listener, addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", "127.0.0.1:1"), Peer::new("b", addr.clone())])
            .unwrap(),
    );
    let (mesh, mut events) = start_node("b", &directory, listener, Duration::from_secs(1));

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client
        .write_all(&encode(Message::hello("a").unwrap()))
        .await
        .unwrap();

    let connection = match next_event(&mut events).await {
        MeshEvent::Connected { peer, connection } => {
            assert_eq!(peer.name, "a");
            connection
        }
        other => panic!("expected connected, got {:?}", other),
    };

    // Second write, itself split mid-frame
    let election = encode(Message::with_term(MessageType::Election, 5).unwrap());
    client.write_all(&election[..3]).await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(&election[3..]).await.unwrap();

    match next_event(&mut events).await {
        MeshEvent::Message { peer, message } => {
            assert_eq!(peer.name, "a");
            assert_eq!(message.typ, MessageType::Election);
            let payload: serde_json::Value = message.json().unwrap().unwrap();
            assert_eq!(payload, serde_json::json!({"term": 5}));
        }
        other => panic!("expected message, got {:?}", other),
    }

    let session = mesh.session("a").await.unwrap().unwrap();
    assert_eq!(session.buffered, 0);
    assert_eq!(session.socket, Some(connection));
}

#[tokio::test]
async fn test_message_before_hello_ends_socket() {
    let (listener, addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", "127.0.0.1:1"), Peer::new("b", addr.clone())])
            .unwrap(),
    );
    let (mesh, mut events) = start_node("b", &directory, listener, Duration::from_secs(1));

    let mut client = TcpStream::connect(&addr).await.unwrap();
    let mut bytes = encode(Message::with_term(MessageType::Election, 5).unwrap());
    bytes.extend(encode(Message::hello("a").unwrap()));
    client.write_all(&bytes).await.unwrap();

    // The mesh closes its side without answering
    let mut received = Vec::new();
    timeout(EVENT_TIMEOUT, client.read_to_end(&mut received))
        .await
        .expect("socket was not ended")
        .unwrap();
    assert!(received.is_empty());
    drop(client);

    match next_event(&mut events).await {
        MeshEvent::Disconnected { peer } => assert!(peer.is_none()),
        other => panic!("expected anonymous disconnect, got {:?}", other),
    }
    assert_quiet(&mut events, Duration::from_millis(200)).await;

    let session = mesh.session("a").await.unwrap().unwrap();
    assert!(session.socket.is_none());
}

#[tokio::test]
async fn test_pipelined_messages_delivered_in_order() {
    let (listener, addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", "127.0.0.1:1"), Peer::new("b", addr.clone())])
            .unwrap(),
    );
    let (_mesh, mut events) = start_node("b", &directory, listener, Duration::from_secs(1));

    let mut bytes = encode(Message::hello("a").unwrap());
    bytes.extend(encode(Message::with_term(MessageType::Alive, 1).unwrap()));
    bytes.extend(encode(Message::with_term(MessageType::Victory, 2).unwrap()));

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client.write_all(&bytes).await.unwrap();

    assert!(matches!(next_event(&mut events).await, MeshEvent::Connected { .. }));
    let mut types = Vec::new();
    for _ in 0..2 {
        match next_event(&mut events).await {
            MeshEvent::Message { message, .. } => types.push(message.typ),
            other => panic!("expected message, got {:?}", other),
        }
    }
    assert_eq!(types, vec![MessageType::Alive, MessageType::Victory]);
}

#[tokio::test]
async fn test_dials_only_greater_names() {
    let (a_listener, a_addr) = bind().await;
    let (b_listener, b_addr) = bind().await;
    let (c_listener, c_addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![
            Peer::new("a", a_addr),
            Peer::new("b", b_addr),
            Peer::new("c", c_addr),
        ])
        .unwrap(),
    );
    let (mesh, mut events) = start_node("b", &directory, b_listener, Duration::from_secs(1));
    mesh.connect().unwrap();

    let (mut stream, _) = timeout(EVENT_TIMEOUT, c_listener.accept())
        .await
        .expect("c was not dialled")
        .unwrap();
    let hello = read_message(&mut stream).await;
    assert_eq!(hello.hello_payload().unwrap().unwrap().name, "b");

    match next_event(&mut events).await {
        MeshEvent::Connected { peer, .. } => assert_eq!(peer.name, "c"),
        other => panic!("expected connected, got {:?}", other),
    }

    assert!(
        timeout(Duration::from_millis(300), a_listener.accept())
            .await
            .is_err(),
        "a must not be dialled by b"
    );
}

#[tokio::test]
async fn test_reconnects_once_after_fixed_delay() {
    let delay = Duration::from_millis(200);
    let (a_listener, a_addr) = bind().await;
    let (b_listener, b_addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", a_addr), Peer::new("b", b_addr)]).unwrap(),
    );
    let (mesh, mut events) = start_node("a", &directory, a_listener, delay);
    mesh.connect().unwrap();

    let (mut first, _) = timeout(EVENT_TIMEOUT, b_listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read_message(&mut first).await.typ, MessageType::Hello);
    assert!(matches!(next_event(&mut events).await, MeshEvent::Connected { .. }));

    drop(first);
    let dropped_at = Instant::now();

    match next_event(&mut events).await {
        MeshEvent::Disconnected { peer } | MeshEvent::Failed { peer, .. } => {
            assert_eq!(peer_name(&peer), Some("b"))
        }
        other => panic!("expected link loss, got {:?}", other),
    }

    let (mut second, remote) = timeout(EVENT_TIMEOUT, b_listener.accept())
        .await
        .expect("no reconnection")
        .unwrap();
    assert!(dropped_at.elapsed() >= delay);
    assert!(remote.ip().is_loopback());
    assert_eq!(read_message(&mut second).await.typ, MessageType::Hello);

    match next_event(&mut events).await {
        MeshEvent::Connected { peer, .. } => assert_eq!(peer.name, "b"),
        other => panic!("expected reconnect, got {:?}", other),
    }

    assert!(
        timeout(delay * 3, b_listener.accept()).await.is_err(),
        "only one reconnection expected"
    );
}

#[tokio::test]
async fn test_failed_dial_is_retried() {
    let delay = Duration::from_millis(100);
    let (a_listener, a_addr) = bind().await;
    let (b_listener, b_addr) = bind().await;
    let b_port_addr = b_addr.clone();
    drop(b_listener);

    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", a_addr), Peer::new("b", b_addr)]).unwrap(),
    );
    let (mesh, mut events) = start_node("a", &directory, a_listener, delay);
    mesh.connect().unwrap();

    match next_event(&mut events).await {
        MeshEvent::Failed { peer, .. } => assert_eq!(peer_name(&peer), Some("b")),
        other => panic!("expected failed dial, got {:?}", other),
    }

    // Bring b up; the next retry lands
    let b_listener = listen_tcp(&b_port_addr).await.unwrap();
    let accepted = timeout(EVENT_TIMEOUT, b_listener.accept()).await;
    assert!(accepted.is_ok(), "dial was not retried");

    loop {
        match next_event(&mut events).await {
            MeshEvent::Failed { .. } => continue,
            MeshEvent::Connected { peer, .. } => {
                assert_eq!(peer.name, "b");
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_disconnect_closes_all_without_reconnect() {
    let delay = Duration::from_millis(100);
    let names = ["a", "b", "c"];
    let mut listeners = Vec::new();
    let mut peers = Vec::new();
    for name in names {
        let (listener, addr) = bind().await;
        listeners.push(listener);
        peers.push(Peer::new(name, addr));
    }
    let directory = Arc::new(PeerDirectory::new(peers).unwrap());

    let mut nodes = Vec::new();
    for (name, listener) in names.iter().zip(listeners) {
        nodes.push(start_node(name, &directory, listener, delay));
    }
    for (mesh, _) in &nodes {
        mesh.connect().unwrap();
    }

    for (mesh, events) in nodes.iter_mut() {
        let mut connected = BTreeSet::new();
        while connected.len() < names.len() - 1 {
            match next_event(events).await {
                MeshEvent::Connected { peer, .. } => {
                    connected.insert(peer.name.clone());
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(mesh.session("a").await.unwrap().is_some());
    }

    let (a_mesh, a_events) = &mut nodes[0];
    a_mesh.disconnect().unwrap();

    let mut gone = BTreeSet::new();
    for _ in 0..names.len() - 1 {
        match next_event(a_events).await {
            MeshEvent::Disconnected { peer } => {
                gone.insert(peer_name(&peer).unwrap().to_string());
            }
            other => panic!("expected disconnected, got {:?}", other),
        }
    }
    assert_eq!(gone, BTreeSet::from(["b".to_string(), "c".to_string()]));

    for peer in ["b", "c"] {
        assert!(a_mesh.session(peer).await.unwrap().unwrap().socket.is_none());
    }

    // The far ends see BYE and the closed link
    for (_, events) in nodes[1..].iter_mut() {
        match next_event(events).await {
            MeshEvent::Disconnected { peer } | MeshEvent::Failed { peer, .. } => {
                assert_eq!(peer_name(&peer), Some("a"))
            }
            other => panic!("expected link loss, got {:?}", other),
        }
    }

    // Nobody redials: a disconnected deliberately and nobody else dials a
    for (_, events) in nodes.iter_mut() {
        assert_quiet(events, delay * 5).await;
    }
}

#[tokio::test]
async fn test_send_and_broadcast() {
    let (a_listener, a_addr) = bind().await;
    let (b_listener, b_addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", a_addr), Peer::new("b", b_addr)]).unwrap(),
    );
    let (a, mut a_events) = start_node("a", &directory, a_listener, Duration::from_secs(1));
    let (b, mut b_events) = start_node("b", &directory, b_listener, Duration::from_secs(1));

    // Not connected yet: dropped quietly
    a.send("b", Message::with_term(MessageType::Election, 1).unwrap())
        .unwrap();

    a.connect().unwrap();
    assert!(matches!(next_event(&mut a_events).await, MeshEvent::Connected { .. }));
    assert!(matches!(next_event(&mut b_events).await, MeshEvent::Connected { .. }));

    a.send("b", Message::with_term(MessageType::Election, 3).unwrap())
        .unwrap();
    match next_event(&mut b_events).await {
        MeshEvent::Message { peer, message } => {
            assert_eq!(peer.name, "a");
            assert_eq!(message, Message::with_term(MessageType::Election, 3).unwrap());
        }
        other => panic!("expected message, got {:?}", other),
    }

    b.broadcast(Message::new(MessageType::Heartbeat, None)).unwrap();
    match next_event(&mut a_events).await {
        MeshEvent::Message { peer, message } => {
            assert_eq!(peer.name, "b");
            assert_eq!(message.typ, MessageType::Heartbeat);
            assert!(message.data.is_none());
        }
        other => panic!("expected message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_second_hello_replaces_binding() {
    let (listener, addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", "127.0.0.1:1"), Peer::new("b", addr.clone())])
            .unwrap(),
    );
    let (mesh, mut events) = start_node("b", &directory, listener, Duration::from_secs(1));

    let mut first = TcpStream::connect(&addr).await.unwrap();
    first
        .write_all(&encode(Message::hello("a").unwrap()))
        .await
        .unwrap();
    let first_id = match next_event(&mut events).await {
        MeshEvent::Connected { connection, .. } => connection,
        other => panic!("expected connected, got {:?}", other),
    };

    let mut second = TcpStream::connect(&addr).await.unwrap();
    second
        .write_all(&encode(Message::hello("a").unwrap()))
        .await
        .unwrap();
    let second_id = match next_event(&mut events).await {
        MeshEvent::Connected { connection, .. } => connection,
        other => panic!("expected connected, got {:?}", other),
    };
    assert_ne!(first_id, second_id);

    // The replaced socket is closed without a disconnect event
    let mut rest = Vec::new();
    timeout(EVENT_TIMEOUT, first.read_to_end(&mut rest))
        .await
        .expect("replaced socket stayed open")
        .ok();
    assert_quiet(&mut events, Duration::from_millis(200)).await;

    assert_eq!(
        mesh.session("a").await.unwrap().unwrap().socket,
        Some(second_id)
    );

    second
        .write_all(&encode(Message::with_term(MessageType::Alive, 9).unwrap()))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        MeshEvent::Message { message, .. } if message.typ == MessageType::Alive
    ));
}

#[tokio::test]
async fn test_shutdown_is_silent() {
    let (a_listener, a_addr) = bind().await;
    let (b_listener, b_addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", a_addr), Peer::new("b", b_addr)]).unwrap(),
    );
    let (a, mut a_events) = start_node("a", &directory, a_listener, Duration::from_millis(100));
    let (_b, mut b_events) = start_node("b", &directory, b_listener, Duration::from_millis(100));

    a.connect().unwrap();
    assert!(matches!(next_event(&mut a_events).await, MeshEvent::Connected { .. }));
    assert!(matches!(next_event(&mut b_events).await, MeshEvent::Connected { .. }));

    a.shutdown().unwrap();
    assert!(timeout(EVENT_TIMEOUT, a_events.recv()).await.unwrap().is_none());

    // b sees the link go away
    match next_event(&mut b_events).await {
        MeshEvent::Disconnected { peer } | MeshEvent::Failed { peer, .. } => {
            assert_eq!(peer_name(&peer), Some("a"))
        }
        other => panic!("expected link loss, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_hello_ends_socket() {
    let (listener, addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", "127.0.0.1:1"), Peer::new("b", addr.clone())])
            .unwrap(),
    );
    let (mesh, mut events) = start_node("b", &directory, listener, Duration::from_secs(1));

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client
        .write_all(&encode(Message::new(MessageType::Hello, None)))
        .await
        .unwrap();

    let mut received = Vec::new();
    timeout(EVENT_TIMEOUT, client.read_to_end(&mut received))
        .await
        .expect("socket was not ended")
        .unwrap();
    assert!(received.is_empty());
    drop(client);

    match next_event(&mut events).await {
        MeshEvent::Disconnected { peer } => assert!(peer.is_none()),
        other => panic!("expected anonymous disconnect, got {:?}", other),
    }
    assert_quiet(&mut events, Duration::from_millis(200)).await;
    assert!(mesh.session("a").await.unwrap().unwrap().socket.is_none());
}

#[tokio::test]
async fn test_bye_ends_socket() {
    let (listener, addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", "127.0.0.1:1"), Peer::new("b", addr.clone())])
            .unwrap(),
    );
    let (mesh, mut events) = start_node("b", &directory, listener, Duration::from_secs(1));

    // Unbound: BYE closes the socket before any HELLO
    let mut anonymous = TcpStream::connect(&addr).await.unwrap();
    anonymous.write_all(&encode(Message::bye())).await.unwrap();
    let mut received = Vec::new();
    timeout(EVENT_TIMEOUT, anonymous.read_to_end(&mut received))
        .await
        .expect("unbound socket was not ended")
        .unwrap();
    drop(anonymous);
    match next_event(&mut events).await {
        MeshEvent::Disconnected { peer } => assert!(peer.is_none()),
        other => panic!("expected anonymous disconnect, got {:?}", other),
    }

    // Bound: nothing after BYE is delivered
    let mut client = TcpStream::connect(&addr).await.unwrap();
    client
        .write_all(&encode(Message::hello("a").unwrap()))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, MeshEvent::Connected { .. }));

    let mut bytes = encode(Message::bye());
    bytes.extend(encode(Message::with_term(MessageType::Election, 7).unwrap()));
    client.write_all(&bytes).await.unwrap();

    let mut received = Vec::new();
    timeout(EVENT_TIMEOUT, client.read_to_end(&mut received))
        .await
        .expect("bound socket was not ended")
        .unwrap();
    assert!(received.is_empty());
    drop(client);

    match next_event(&mut events).await {
        MeshEvent::Disconnected { peer } => assert_eq!(peer_name(&peer), Some("a")),
        other => panic!("expected disconnect from a, got {:?}", other),
    }
    assert_quiet(&mut events, Duration::from_millis(200)).await;
    assert!(mesh.session("a").await.unwrap().unwrap().socket.is_none());
}

#[tokio::test]
async fn test_application_tag_delivered() {
    let (listener, addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", "127.0.0.1:1"), Peer::new("b", addr.clone())])
            .unwrap(),
    );
    let (mesh, mut events) = start_node("b", &directory, listener, Duration::from_secs(1));

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client
        .write_all(&encode(Message::hello("a").unwrap()))
        .await
        .unwrap();
    let connection = match next_event(&mut events).await {
        MeshEvent::Connected { connection, .. } => connection,
        other => panic!("expected connected, got {:?}", other),
    };

    // Tag 0x20 is not one of the named election types
    let payload = br#"{"term":5}"#;
    let mut frame = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
    frame.push(0x20);
    frame.extend_from_slice(payload);
    client.write_all(&frame).await.unwrap();

    match next_event(&mut events).await {
        MeshEvent::Message { peer, message } => {
            assert_eq!(peer.name, "a");
            assert_eq!(message.typ, MessageType::Application(0x20));
            assert_eq!(message.data.as_deref(), Some(r#"{"term":5}"#));
        }
        other => panic!("expected message, got {:?}", other),
    }
    assert_eq!(
        mesh.session("a").await.unwrap().unwrap().socket,
        Some(connection)
    );
}

#[tokio::test]
async fn test_disconnect_drops_queued_writes() {
    const FRAMES: usize = 64;
    const PAYLOAD_SIZE: usize = 512 * 1024;

    let (listener, addr) = bind().await;
    let directory = Arc::new(
        PeerDirectory::new(vec![Peer::new("a", "127.0.0.1:1"), Peer::new("b", addr.clone())])
            .unwrap(),
    );
    let (mesh, mut events) = start_node("b", &directory, listener, Duration::from_secs(1));

    let mut client = TcpStream::connect(&addr).await.unwrap();
    client
        .write_all(&encode(Message::hello("a").unwrap()))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, MeshEvent::Connected { .. }));

    // The client does not read, so most of this stays queued in the mesh
    let bulk = Message::new(MessageType::Election, Some("x".repeat(PAYLOAD_SIZE)));
    let queued = FRAMES * bulk.encoded_size();
    for _ in 0..FRAMES {
        mesh.send("a", bulk.clone()).unwrap();
    }
    mesh.disconnect().unwrap();

    match next_event(&mut events).await {
        MeshEvent::Disconnected { peer } => assert_eq!(peer_name(&peer), Some("a")),
        other => panic!("expected disconnected, got {:?}", other),
    }

    let mut received = 0;
    let mut chunk = vec![0u8; 64 * 1024];
    let drained = timeout(EVENT_TIMEOUT, async {
        loop {
            match client.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received += n,
            }
        }
    })
    .await;
    assert!(drained.is_ok(), "socket stayed open after disconnect");
    assert!(
        received < queued,
        "{} of {} queued bytes delivered after disconnect",
        received,
        queued
    );
    assert_quiet(&mut events, Duration::from_millis(200)).await;
}
