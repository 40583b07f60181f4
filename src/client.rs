use crate::config::RudpConfig;
use crate::connection::Connection;
use crate::error::RudpError;
use crate::packet::{DeliveryMode, Packet, PacketType, HEADER_SIZE, MAX_PACKET_SIZE};
use crate::send_pipeline::SendPipeline;
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace};

/// Host-installed event surface for the client side.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    async fn on_message(&self, packet: Packet);
    async fn on_disconnect(&self);
}

struct ClientState {
    send_pipeline: Arc<SendPipeline>,
    connection: Arc<Connection>,
    recv_handle: JoinHandle<()>,
}

/// A client endpoint: one socket, one connection to one server.
///
/// The client id is generated once per endpoint from a cryptographically random
///  source and embedded in every packet; it is the server's routing key and a
///  bearer token - anyone holding it can continue this client's session.
pub struct Client {
    config: Arc<RudpConfig>,
    client_id: u32,
    state: RwLock<Option<ClientState>>,
    connected: AtomicBool,
}

impl Client {
    pub fn new(config: RudpConfig) -> anyhow::Result<Client> {
        config.validate()?;

        Ok(Client {
            config: Arc::new(config),
            client_id: rand::random(),
            state: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Resolve the server address, perform the handshake, and start the
    ///  background receive loops.
    ///
    /// The handshake runs *before* any background reader exists, so the
    ///  CONNECT_ACK cannot be consumed elsewhere. Fails with `Timeout` if no
    ///  matching CONNECT_ACK arrives within the configured deadline.
    pub async fn connect(&self, addr: &str, handler: Arc<dyn ClientHandler>) -> Result<(), RudpError> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(RudpError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "client is already connected",
            )));
        }

        let server_addr = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;

        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let send_pipeline = Arc::new(SendPipeline::new(Arc::new(socket.clone())));
        let connection = Arc::new(Connection::new(
            self.config.clone(),
            send_pipeline.clone(),
            server_addr,
            self.client_id,
        ));

        let connect_packet = connection.handshake_packet(PacketType::Connect).await;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        connect_packet.ser(&mut buf);
        send_pipeline.do_send_packet(server_addr, &buf).await;

        self.await_connect_ack(&socket).await?;

        info!("connected to {:?} as client {:08x}", server_addr, self.client_id);

        connection.spawn_loops();
        let recv_handle = tokio::spawn(Self::recv_loop(socket.clone(), connection.clone()));
        // the delivery loop winds down on its own once the connection closes,
        //  firing on_disconnect on the way out
        tokio::spawn(Self::delivery_loop(connection.clone(), handler));

        *state = Some(ClientState {
            send_pipeline,
            connection,
            recv_handle,
        });
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Read datagrams in short slices until the matching CONNECT_ACK arrives or
    ///  the overall deadline expires. Everything else is discarded.
    async fn await_connect_ack(&self, socket: &UdpSocket) -> Result<(), RudpError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut buf = [0u8; MAX_PACKET_SIZE];

        while Instant::now() < deadline {
            let received = match timeout(self.config.handshake_poll_interval, socket.recv_from(&mut buf)).await {
                Err(_) => continue, // poll slice elapsed, re-check the deadline
                Ok(Err(e)) => {
                    debug!("socket error during handshake: {}", e);
                    continue;
                }
                Ok(Ok((len, _))) => len,
            };

            match Packet::deser(&mut &buf[..received]) {
                Ok(packet)
                    if packet.packet_type == PacketType::ConnectAck
                        && packet.client_id == self.client_id =>
                {
                    return Ok(());
                }
                Ok(packet) => {
                    trace!("discarding {:?} during handshake", packet.packet_type);
                }
                Err(_) => {
                    debug!("discarding malformed datagram during handshake");
                }
            }
        }

        debug!("handshake timed out for client {:08x}", self.client_id);
        Err(RudpError::Timeout)
    }

    /// Queue a payload for transmission to the server.
    pub async fn send(&self, payload: &[u8], mode: DeliveryMode) -> Result<(), RudpError> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(RudpError::ConnectionClosed)?;
        state.connection.send(payload, mode).await
    }

    /// Handshake completed and the connection's own liveness still holds.
    pub async fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        match self.state.read().await.as_ref() {
            Some(state) => state.connection.is_connected().await,
            None => false,
        }
    }

    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        match self.state.read().await.as_ref() {
            Some(state) => Some(state.connection.remote_addr().await),
            None => None,
        }
    }

    /// Tear down the connection and the socket. A best-effort DISCONNECT tells
    ///  the server not to wait for the inactivity timeout.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Release);

        let Some(state) = self.state.write().await.take() else {
            return;
        };

        let goodbye = state
            .connection
            .handshake_packet(PacketType::Disconnect)
            .await;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        goodbye.ser(&mut buf);
        state
            .send_pipeline
            .do_send_packet(state.connection.remote_addr().await, &buf)
            .await;

        state.connection.close().await;
        state.recv_handle.abort();
    }

    /// Reads raw datagrams off the socket and feeds DATA packets into the
    ///  connection. Late handshake packets (duplicate CONNECT_ACKs) are dropped
    ///  here - the handshake itself completed before this loop existed.
    async fn recv_loop(socket: Arc<UdpSocket>, connection: Arc<Connection>) {
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    debug!("socket error: {}", e);
                    continue;
                }
            };

            let packet = match Packet::deser(&mut &buf[..len]) {
                Ok(packet) => packet,
                Err(_) => {
                    debug!("dropping malformed datagram from {:?}", from);
                    continue;
                }
            };

            match packet.packet_type {
                PacketType::Data => connection.handle_incoming(packet).await,
                PacketType::Disconnect => {
                    debug!("server closed the connection");
                    connection.close().await;
                    return;
                }
                PacketType::Connect | PacketType::ConnectAck => {
                    trace!("dropping late handshake packet");
                }
            }
        }
    }

    async fn delivery_loop(connection: Arc<Connection>, handler: Arc<dyn ClientHandler>) {
        loop {
            match connection.receive().await {
                Ok(packet) => handler.on_message(packet).await,
                Err(_) => break,
            }
        }

        handler.on_disconnect().await;
    }
}
