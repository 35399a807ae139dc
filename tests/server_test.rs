use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use muster::{
    Connection, Server, ServerHandle, ServerListener, TransportConfig, TransportError,
    TransportResult,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Debug)]
enum Event {
    Connected(Arc<Connection>),
    Packet(u64, Bytes),
    Disconnected(u64),
    Timer,
}

struct RecordingListener {
    events: mpsc::UnboundedSender<Event>,
}

impl ServerListener for RecordingListener {
    fn on_new_connection(&mut self, connection: &Arc<Connection>) {
        let _ = self.events.send(Event::Connected(connection.clone()));
    }

    fn on_packet_received(&mut self, connection: &Arc<Connection>, payload: Bytes) {
        let _ = self.events.send(Event::Packet(connection.id(), payload));
    }

    fn on_disconnected(&mut self, connection: &Arc<Connection>) {
        let _ = self.events.send(Event::Disconnected(connection.id()));
    }

    fn on_timer(&mut self) {
        let _ = self.events.send(Event::Timer);
    }
}

struct TestServer {
    handle: ServerHandle,
    events: mpsc::UnboundedReceiver<Event>,
    addr: SocketAddr,
    join: JoinHandle<TransportResult<()>>,
}

async fn start_server_with(config: TransportConfig) -> TestServer {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut server = Server::new(config, RecordingListener { events: events_tx });
    server.start(0).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let join = tokio::spawn(async move { server.run().await });
    TestServer {
        handle,
        events: events_rx,
        addr,
        join,
    }
}

async fn start_server() -> TestServer {
    start_server_with(TransportConfig::default()).await
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a listener event")
        .expect("listener event channel closed")
}

async fn expect_connected(events: &mut mpsc::UnboundedReceiver<Event>) -> Arc<Connection> {
    match next_event(events).await {
        Event::Connected(connection) => connection,
        other => panic!("expected Connected, got {:?}", other),
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(payload);
    wire
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

#[tokio::test]
async fn accept_notifies_listener_and_tracks_connection() {
    let mut server = start_server().await;

    let _client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;

    assert!(connection.is_open());
    assert_eq!(server.handle.connection_count(), 1);

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn inbound_packets_are_delivered_in_order() {
    let mut server = start_server().await;

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;

    let mut wire = frame(b"move north");
    wire.extend_from_slice(&frame(b"end turn"));
    client.write_all(&wire).await.unwrap();

    match next_event(&mut server.events).await {
        Event::Packet(id, payload) => {
            assert_eq!(id, connection.id());
            assert_eq!(&payload[..], b"move north");
        }
        other => panic!("expected Packet, got {:?}", other),
    }
    match next_event(&mut server.events).await {
        Event::Packet(_, payload) => assert_eq!(&payload[..], b"end turn"),
        other => panic!("expected Packet, got {:?}", other),
    }

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn outbound_packets_are_framed_in_order() {
    let mut server = start_server().await;

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;

    server.handle.send_packet(&connection, b"hail");
    server.handle.send_packet(&connection, b"well met");

    assert_eq!(read_frame(&mut client).await, b"hail");
    assert_eq!(read_frame(&mut client).await, b"well met");

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn peer_disconnect_notifies_exactly_once() {
    let mut server = start_server().await;

    let client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;
    drop(client);

    match next_event(&mut server.events).await {
        Event::Disconnected(id) => assert_eq!(id, connection.id()),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert_eq!(server.handle.connection_count(), 0);
    assert!(!connection.is_open());

    // no second notification may follow
    assert!(
        timeout(Duration::from_millis(300), server.events.recv())
            .await
            .is_err()
    );

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn packets_ahead_of_peer_close_arrive_before_the_disconnect() {
    let mut server = start_server().await;

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;

    client.write_all(&frame(b"parting shot")).await.unwrap();
    client.shutdown().await.unwrap();
    drop(client);

    match next_event(&mut server.events).await {
        Event::Packet(id, payload) => {
            assert_eq!(id, connection.id());
            assert_eq!(&payload[..], b"parting shot");
        }
        other => panic!("expected Packet before Disconnected, got {:?}", other),
    }
    match next_event(&mut server.events).await {
        Event::Disconnected(id) => assert_eq!(id, connection.id()),
        other => panic!("expected Disconnected, got {:?}", other),
    }

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn close_connection_notifies_exactly_once() {
    let mut server = start_server().await;

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;

    server.handle.close_connection(&connection);

    match next_event(&mut server.events).await {
        Event::Disconnected(id) => assert_eq!(id, connection.id()),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert_eq!(server.handle.connection_count(), 0);

    // the peer observes EOF
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);

    assert!(
        timeout(Duration::from_millis(300), server.events.recv())
            .await
            .is_err()
    );

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn oversized_inbound_frame_closes_the_connection() {
    let mut config = TransportConfig::default();
    config.network.max_frame_size = 64;
    let mut server = start_server_with(config).await;

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;

    // corrupted header declaring a pathological length
    client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    match next_event(&mut server.events).await {
        Event::Disconnected(id) => assert_eq!(id, connection.id()),
        other => panic!("expected Disconnected without any Packet, got {:?}", other),
    }
    assert_eq!(server.handle.connection_count(), 0);

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn send_packet_to_closed_connection_is_a_quiet_failure() {
    let mut server = start_server().await;

    let client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;
    drop(client);

    match next_event(&mut server.events).await {
        Event::Disconnected(_) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }

    // reported to the server's log, not propagated to the caller
    server.handle.send_packet(&connection, b"too late");

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
#[should_panic(expected = "closing untracked")]
async fn closing_an_untracked_connection_is_a_caller_bug() {
    let mut server = start_server().await;

    let client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;
    drop(client);

    match next_event(&mut server.events).await {
        Event::Disconnected(_) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }

    server.handle.close_connection(&connection);
}

#[tokio::test]
async fn timer_fires_once_after_duration() {
    let mut server = start_server().await;

    let started = Instant::now();
    let _timer = server.handle.set_timer(Duration::from_millis(300));

    match next_event(&mut server.events).await {
        Event::Timer => {}
        other => panic!("expected Timer, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(300));

    assert!(
        timeout(Duration::from_millis(300), server.events.recv())
            .await
            .is_err()
    );

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelled_timer_does_not_fire() {
    let mut server = start_server().await;

    let timer = server.handle.set_timer(Duration::from_secs(5));
    timer.cancel();

    assert!(
        timeout(Duration::from_millis(400), server.events.recv())
            .await
            .is_err()
    );

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();
}

#[tokio::test]
async fn run_for_returns_after_duration() {
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let mut server = Server::new(
        TransportConfig::default(),
        RecordingListener { events: events_tx },
    );
    server.start(0).await.unwrap();

    let started = Instant::now();
    server.run_for(Duration::from_millis(200)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn shutdown_delivers_pending_disconnects() {
    let mut server = start_server().await;

    let _client = TcpStream::connect(server.addr).await.unwrap();
    let connection = expect_connected(&mut server.events).await;

    server.handle.shutdown();
    server.join.await.unwrap().unwrap();

    let mut disconnects = 0;
    while let Some(event) = server.events.recv().await {
        if let Event::Disconnected(id) = event {
            assert_eq!(id, connection.id());
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn binding_an_occupied_port_fails_startup() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let mut config = TransportConfig::default();
    config.network.bind_ip = "127.0.0.1".to_string();
    let mut server = Server::new(config, RecordingListener { events: events_tx });

    let result = server.start(port).await;
    assert!(matches!(result, Err(TransportError::Bind(_))));
}
