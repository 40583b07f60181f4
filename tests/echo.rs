//! End-to-end scenarios over real localhost sockets.

use async_trait::async_trait;
use bytes::BytesMut;
use rudp::{
    Client, ClientHandler, Connection, DeliveryMode, Packet, PacketType, RudpConfig, RudpError,
    Server, ServerHandler, MAX_PAYLOAD,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, PartialEq, Eq)]
enum ServerEvent {
    Connect(u32),
    Message(u32, Vec<u8>),
    Disconnect(u32),
}

/// records events; echoes every message back with an `Echo: ` prefix when asked
struct EchoHandler {
    events: mpsc::UnboundedSender<ServerEvent>,
    echo: bool,
}

#[async_trait]
impl ServerHandler for EchoHandler {
    async fn on_connect(&self, connection: Arc<Connection>) {
        let _ = self.events.send(ServerEvent::Connect(connection.client_id()));
    }

    async fn on_message(&self, connection: Arc<Connection>, packet: Packet) {
        let _ = self
            .events
            .send(ServerEvent::Message(connection.client_id(), packet.payload.clone()));

        if self.echo {
            let mut reply = b"Echo: ".to_vec();
            reply.extend_from_slice(&packet.payload);
            connection
                .send(&reply, DeliveryMode::Reliable)
                .await
                .unwrap();
        }
    }

    async fn on_disconnect(&self, connection: Arc<Connection>) {
        let _ = self
            .events
            .send(ServerEvent::Disconnect(connection.client_id()));
    }
}

struct CollectingClientHandler {
    messages: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl ClientHandler for CollectingClientHandler {
    async fn on_message(&self, packet: Packet) {
        let _ = self.messages.send(packet.payload);
    }

    async fn on_disconnect(&self) {}
}

fn fast_config() -> RudpConfig {
    RudpConfig {
        handshake_timeout: Duration::from_secs(2),
        ..RudpConfig::default()
    }
}

async fn start_server(echo: bool) -> (Server, SocketAddr, mpsc::UnboundedReceiver<ServerEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let server = Server::new(
        fast_config(),
        Arc::new(EchoHandler {
            events: events_tx,
            echo,
        }),
    )
    .unwrap();
    server.listen("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr, events_rx)
}

async fn connect_client(addr: SocketAddr) -> (Client, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    let client = Client::new(fast_config()).unwrap();
    client
        .connect(
            &addr.to_string(),
            Arc::new(CollectingClientHandler {
                messages: messages_tx,
            }),
        )
        .await
        .unwrap();
    (client, messages_rx)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn echo_round_trip() {
    let (server, addr, mut server_events) = start_server(true).await;
    let (client, mut client_messages) = connect_client(addr).await;

    assert!(client.is_connected().await);
    assert_eq!(next(&mut server_events).await, ServerEvent::Connect(client.client_id()));

    client.send(b"Hello", DeliveryMode::Reliable).await.unwrap();

    assert_eq!(
        next(&mut server_events).await,
        ServerEvent::Message(client.client_id(), b"Hello".to_vec())
    );
    assert_eq!(next(&mut client_messages).await, b"Echo: Hello".to_vec());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn handshake_times_out_against_silent_peer() {
    let config = RudpConfig {
        handshake_timeout: Duration::from_millis(400),
        ..RudpConfig::default()
    };

    // a bound socket nobody reads from: CONNECT goes nowhere
    let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = black_hole.local_addr().unwrap();

    let (messages_tx, _messages_rx) = mpsc::unbounded_channel();
    let client = Client::new(config).unwrap();

    let started = std::time::Instant::now();
    let result = client
        .connect(
            &addr.to_string(),
            Arc::new(CollectingClientHandler {
                messages: messages_tx,
            }),
        )
        .await;

    assert!(matches!(result, Err(RudpError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let (server, addr, _server_events) = start_server(false).await;
    let (client, _client_messages) = connect_client(addr).await;

    let result = client.send(&vec![0u8; 1400], DeliveryMode::Reliable).await;
    match result {
        Err(RudpError::PacketTooLarge(len)) => {
            assert_eq!(len, 1400);
            assert!(len > MAX_PAYLOAD);
        }
        other => panic!("expected PacketTooLarge, got {:?}", other.err()),
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn ordered_messages_arrive_in_order_from_the_first() {
    let (server, addr, mut server_events) = start_server(false).await;
    let (client, _client_messages) = connect_client(addr).await;

    next(&mut server_events).await; // connect

    for payload in [b"one".as_slice(), b"two", b"three"] {
        client
            .send(payload, DeliveryMode::ReliableOrdered)
            .await
            .unwrap();
    }

    for expected in [b"one".as_slice(), b"two", b"three"] {
        assert_eq!(
            next(&mut server_events).await,
            ServerEvent::Message(client.client_id(), expected.to_vec())
        );
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (server, addr, mut server_events) = start_server(false).await;
    let (client_a, mut messages_a) = connect_client(addr).await;
    let (client_b, mut messages_b) = connect_client(addr).await;

    next(&mut server_events).await;
    next(&mut server_events).await;
    assert_eq!(server.connection_count().await, 2);

    server.broadcast(b"tick", DeliveryMode::Reliable).await.unwrap();

    assert_eq!(next(&mut messages_a).await, b"tick".to_vec());
    assert_eq!(next(&mut messages_b).await, b"tick".to_vec());

    client_a.close().await;
    client_b.close().await;
    server.close().await;
}

#[tokio::test]
async fn disconnect_notifies_the_server() {
    let (server, addr, mut server_events) = start_server(false).await;
    let (client, _client_messages) = connect_client(addr).await;

    let client_id = client.client_id();
    next(&mut server_events).await; // connect

    client.close().await;

    assert_eq!(next(&mut server_events).await, ServerEvent::Disconnect(client_id));
    assert_eq!(server.connection_count().await, 0);

    server.close().await;
}

fn marshal(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::new();
    packet.ser(&mut buf);
    buf.to_vec()
}

async fn raw_handshake(socket: &UdpSocket, server_addr: SocketAddr, client_id: u32) {
    socket
        .send_to(&marshal(&Packet::connect(client_id)), server_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 1400];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let ack = Packet::deser(&mut &buf[..len]).unwrap();
    assert_eq!(ack.packet_type, PacketType::ConnectAck);
    assert_eq!(ack.client_id, client_id);
}

/// a client that reconnects from a new source port keeps its registry entry,
///  and server traffic follows it to the new address
#[tokio::test]
async fn reconnect_from_new_port_migrates_the_address() {
    let (server, addr, mut server_events) = start_server(false).await;
    let client_id = 0x5eed_cafe;

    let first_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw_handshake(&first_socket, addr, client_id).await;
    assert_eq!(next(&mut server_events).await, ServerEvent::Connect(client_id));

    let mut data = Packet::connect(client_id);
    data.packet_type = PacketType::Data;
    data.mode = DeliveryMode::Reliable;
    data.sequence = rudp::SequenceNumber::from_raw(1);
    data.payload = b"from p1".to_vec();
    first_socket.send_to(&marshal(&data), addr).await.unwrap();
    assert_eq!(
        next(&mut server_events).await,
        ServerEvent::Message(client_id, b"from p1".to_vec())
    );

    // same identity, new port
    let second_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw_handshake(&second_socket, addr, client_id).await;

    assert_eq!(server.connection_count().await, 1);
    let connection = server.connection(client_id).await.unwrap();
    assert_eq!(
        connection.remote_addr().await,
        second_socket.local_addr().unwrap()
    );

    // server-originated traffic lands on the new socket
    connection.send(b"hi again", DeliveryMode::Unreliable).await.unwrap();
    let mut buf = [0u8; 1400];
    let (len, from) = timeout(Duration::from_secs(2), second_socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, addr);
    let packet = Packet::deser(&mut &buf[..len]).unwrap();
    assert_eq!(packet.payload, b"hi again".to_vec());

    server.close().await;
}

/// forwards datagrams between a client and the server, eating the first few
///  inbound DATA packets - handshakes and retransmitted copies pass
async fn spawn_lossy_proxy(server_addr: SocketAddr, drop_first: u64) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut client_addr: Option<SocketAddr> = None;
        let mut data_counter = 0u64;
        let mut buf = [0u8; 1400];

        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };

            if from == server_addr {
                if let Some(client) = client_addr {
                    let _ = socket.send_to(&buf[..len], client).await;
                }
                continue;
            }

            client_addr = Some(from);
            if buf[0] == 0 {
                data_counter += 1;
                if data_counter <= drop_first {
                    continue;
                }
            }
            let _ = socket.send_to(&buf[..len], server_addr).await;
        }
    });

    proxy_addr
}

/// reliable-ordered delivery survives heavy loss via retransmission
#[tokio::test]
async fn reliable_messages_survive_a_lossy_link() {
    let (server, addr, mut server_events) = start_server(false).await;
    let proxy_addr = spawn_lossy_proxy(addr, 5).await;
    let (client, _client_messages) = connect_client(proxy_addr).await;

    next(&mut server_events).await; // connect

    let payloads: Vec<Vec<u8>> = (0..8).map(|i| format!("msg-{i}").into_bytes()).collect();
    for payload in &payloads {
        client
            .send(payload, DeliveryMode::ReliableOrdered)
            .await
            .unwrap();
    }

    // every payload arrives, in order, despite half the copies being dropped
    for expected in &payloads {
        assert_eq!(
            next(&mut server_events).await,
            ServerEvent::Message(client.client_id(), expected.clone())
        );
    }

    client.close().await;
    server.close().await;
}
