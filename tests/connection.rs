//! Connection manager integration tests over loopback TCP

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use beacon_ring::discovery::SERVICE_TYPE;
use beacon_ring::{
    Command, ConnectionEvent, ConnectionManager, ConnectionState, DiscoveredEndpoint, Error,
    Listener, Message, ServiceDescriptor,
};

mod common;

use common::WAIT;

async fn bind() -> Listener {
    ConnectionManager::listen(&ServiceDescriptor::new("test", SERVICE_TYPE))
        .await
        .unwrap()
}

fn loopback(listener: &Listener) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], listener.local_addr().port()))
}

fn endpoint(addr: SocketAddr) -> DiscoveredEndpoint {
    DiscoveredEndpoint {
        instance: format!("test.{SERVICE_TYPE}"),
        service_type: SERVICE_TYPE.to_string(),
        addrs: vec![addr],
    }
}

async fn next_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_later_inbound_peer_preempts_earlier() {
    let listener = bind().await;
    let addr = loopback(&listener);
    let (tx, _rx) = mpsc::channel(16);
    let mut manager = ConnectionManager::new(tx);

    let mut first_client = TcpStream::connect(addr).await.unwrap();
    let (stream, peer) = listener.accept().await.unwrap();
    let first = manager.accept(stream, peer).await;
    assert!(first.is_ready());

    let _second_client = TcpStream::connect(addr).await.unwrap();
    let (stream, peer) = listener.accept().await.unwrap();
    let second = manager.accept(stream, peer).await;

    assert_eq!(first.state(), ConnectionState::Closed);
    assert!(second.is_ready());
    assert_eq!(manager.current().map(|c| c.id()), Some(second.id()));
    assert!(matches!(
        first.send(&Message::command(Command::Ring)).await,
        Err(Error::NotConnected)
    ));

    // The preempted peer sees its transport go away
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, first_client.read(&mut buf))
        .await
        .expect("preempted peer was not disconnected");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_send_without_ready_connection_is_rejected() {
    let (tx, _rx) = mpsc::channel(16);
    let mut manager = ConnectionManager::new(tx);

    let result = manager.send(&Message::command(Command::Ring)).await;
    assert!(matches!(result, Err(Error::NotConnected)));

    let listener = bind().await;
    let addr = loopback(&listener);
    let conn = manager.connect(&endpoint(addr)).await.unwrap();
    let (mut server_side, _) = listener.accept().await.unwrap();

    conn.close().await;
    assert!(matches!(
        conn.send(&Message::command(Command::Ring)).await,
        Err(Error::NotConnected)
    ));

    // Nothing was written after close
    let mut buf = Vec::new();
    let read = tokio::time::timeout(WAIT, server_side.read_to_end(&mut buf))
        .await
        .unwrap();
    tokio_test::assert_ok!(read);
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_inbound_chunk_is_delivered_as_message() {
    let listener = bind().await;
    let addr = loopback(&listener);
    let (tx, mut rx) = mpsc::channel(16);
    let mut manager = ConnectionManager::new(tx);

    let conn = manager.connect(&endpoint(addr)).await.unwrap();
    let (mut server_side, _) = listener.accept().await.unwrap();
    server_side.write_all(b"RING").await.unwrap();

    match next_event(&mut rx).await {
        ConnectionEvent::Message { id, message } => {
            assert_eq!(id, conn.id());
            assert_eq!(message.known_command(), Some(Command::Ring));
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_drop_closes_connection() {
    let listener = bind().await;
    let addr = loopback(&listener);
    let (tx, mut rx) = mpsc::channel(16);
    let mut manager = ConnectionManager::new(tx);

    let conn = manager.connect(&endpoint(addr)).await.unwrap();
    let (server_side, _) = listener.accept().await.unwrap();
    drop(server_side);

    let state = tokio::time::timeout(WAIT, conn.closed()).await.unwrap();
    assert!(state.is_terminal());

    match next_event(&mut rx).await {
        ConnectionEvent::Closed { id, state } => {
            assert_eq!(id, conn.id());
            assert!(state.is_terminal());
            assert!(manager.handle_closed(id));
        }
        other => panic!("expected close, got {other:?}"),
    }

    assert!(manager.current().is_none());
    assert!(matches!(
        manager.send(&Message::command(Command::Ring)).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_connect_to_dead_endpoint_fails() {
    let listener = bind().await;
    let addr = loopback(&listener);
    drop(listener);

    let (tx, _rx) = mpsc::channel(16);
    let mut manager = ConnectionManager::new(tx);

    let result = manager.connect(&endpoint(addr)).await;
    assert!(matches!(result, Err(Error::Connect { .. })));
    assert!(manager.current().is_none());
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_closed_event_from_superseded_connection_is_ignored() {
    let listener = bind().await;
    let addr = loopback(&listener);
    let (tx, mut rx) = mpsc::channel(16);
    let mut manager = ConnectionManager::new(tx);

    let first = manager.connect(&endpoint(addr)).await.unwrap();
    let _first_server = listener.accept().await.unwrap();
    let second = manager.connect(&endpoint(addr)).await.unwrap();
    let _second_server = listener.accept().await.unwrap();

    match next_event(&mut rx).await {
        ConnectionEvent::Closed { id, .. } => {
            assert_eq!(id, first.id());
            assert!(!manager.handle_closed(id));
        }
        other => panic!("expected close, got {other:?}"),
    }
    assert!(manager.is_current(second.id()));
}
