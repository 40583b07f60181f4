use crate::config::RudpConfig;
use crate::connection::Connection;
use crate::error::RudpError;
use crate::packet::{DeliveryMode, Packet, PacketType, HEADER_SIZE, MAX_PACKET_SIZE};
use crate::send_pipeline::SendPipeline;
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, trace};

/// Host-installed event surface. `on_message` fires once per delivered packet,
///  in delivery order per connection.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    async fn on_connect(&self, connection: Arc<Connection>);
    async fn on_message(&self, connection: Arc<Connection>, packet: Packet);
    async fn on_disconnect(&self, connection: Arc<Connection>);
}

type Registry = Arc<RwLock<FxHashMap<u32, Arc<Connection>>>>;

/// The demultiplexer: one UDP socket shared by all connections.
///
/// Incoming datagrams are routed to connections by the client id embedded in
///  every packet - never by source address, so a peer behind a NAT can change
///  ports without losing its connection (the stored address follows the
///  latest valid packet). Client ids are bearer tokens: whoever presents one
///  is the connection's owner.
pub struct Server {
    config: Arc<RudpConfig>,
    handler: Arc<dyn ServerHandler>,
    registry: Registry,
    socket: std::sync::Mutex<Option<Arc<UdpSocket>>>,
    loop_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Server {
    fn drop(&mut self) {
        for handle in self.loop_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Server {
    pub fn new(config: RudpConfig, handler: Arc<dyn ServerHandler>) -> anyhow::Result<Server> {
        config.validate()?;

        Ok(Server {
            config: Arc::new(config),
            handler,
            registry: Default::default(),
            socket: std::sync::Mutex::new(None),
            loop_handles: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Bind the shared socket and start the receive and sweep loops.
    pub async fn listen(&self, addr: &str) -> anyhow::Result<()> {
        if self.socket.lock().unwrap().is_some() {
            anyhow::bail!("server is already listening");
        }

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("listening on {:?}", socket.local_addr()?);

        let send_pipeline = Arc::new(SendPipeline::new(Arc::new(socket.clone())));

        let mut handles = self.loop_handles.lock().unwrap();
        handles.push(tokio::spawn(Self::recv_loop(
            self.config.clone(),
            socket.clone(),
            send_pipeline,
            self.registry.clone(),
            self.handler.clone(),
        )));
        handles.push(tokio::spawn(Self::sweep_loop(
            self.config.clone(),
            self.registry.clone(),
        )));
        drop(handles);

        *self.socket.lock().unwrap() = Some(socket);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    pub async fn connection(&self, client_id: u32) -> Option<Arc<Connection>> {
        self.registry.read().await.get(&client_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Send the payload to every currently registered connection. Individual
    ///  failures are collected and reported together; one failing connection
    ///  never prevents sends to the others.
    pub async fn broadcast(&self, payload: &[u8], mode: DeliveryMode) -> Result<(), RudpError> {
        let registry = self.registry.read().await;

        let mut failures = Vec::new();
        for (&client_id, connection) in registry.iter() {
            if let Err(e) = connection.send(payload, mode).await {
                debug!("broadcast to client {:08x} failed: {}", client_id, e);
                failures.push((client_id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RudpError::Broadcast(failures))
        }
    }

    /// Stop both loops and close every registered connection.
    pub async fn close(&self) {
        for handle in self.loop_handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        let connections: Vec<Arc<Connection>> =
            self.registry.write().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close().await;
        }

        *self.socket.lock().unwrap() = None;
        info!("server closed");
    }

    async fn recv_loop(
        config: Arc<RudpConfig>,
        socket: Arc<UdpSocket>,
        send_pipeline: Arc<SendPipeline>,
        registry: Registry,
        handler: Arc<dyn ServerHandler>,
    ) {
        info!("starting receive loop");
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

            Self::process_datagram(&config, &send_pipeline, &registry, &handler, packet, from)
                .await;
        }
    }

    async fn process_datagram(
        config: &Arc<RudpConfig>,
        send_pipeline: &Arc<SendPipeline>,
        registry: &Registry,
        handler: &Arc<dyn ServerHandler>,
        packet: Packet,
        from: SocketAddr,
    ) {
        trace!(
            "datagram from {:?}: {:?} client {:08x}",
            from,
            packet.packet_type,
            packet.client_id
        );

        match packet.packet_type {
            PacketType::Connect => {
                Self::handle_connect(config, send_pipeline, registry, handler, packet.client_id, from)
                    .await;
            }
            PacketType::Disconnect => {
                let connection = registry.read().await.get(&packet.client_id).cloned();
                if let Some(connection) = connection {
                    debug!("client {:08x} requested disconnect", packet.client_id);
                    connection.close().await;
                }
            }
            PacketType::ConnectAck => {
                // clients acknowledge, servers never expect one
                trace!("dropping stray CONNECT_ACK from {:?}", from);
            }
            PacketType::Data => {
                let connection = registry.read().await.get(&packet.client_id).cloned();
                match connection {
                    None => {
                        // unknown clients must establish via CONNECT first
                        debug!(
                            "dropping packet from unknown client {:08x} at {:?}",
                            packet.client_id, from
                        );
                    }
                    Some(connection) => {
                        connection.set_remote_addr(from).await;
                        connection.handle_incoming(packet).await;
                    }
                }
            }
        }
    }

    async fn handle_connect(
        config: &Arc<RudpConfig>,
        send_pipeline: &Arc<SendPipeline>,
        registry: &Registry,
        handler: &Arc<dyn ServerHandler>,
        client_id: u32,
        from: SocketAddr,
    ) {
        let (connection, is_new) = {
            let mut registry_guard = registry.write().await;
            match registry_guard.entry(client_id) {
                Entry::Occupied(e) => (e.get().clone(), false),
                Entry::Vacant(e) => {
                    let connection = Arc::new(Connection::new(
                        config.clone(),
                        send_pipeline.clone(),
                        from,
                        client_id,
                    ));
                    connection.spawn_loops();
                    e.insert(connection.clone());
                    (connection, true)
                }
            }
        };

        // a reconnect may come from a new port
        connection.set_remote_addr(from).await;

        // The CONNECT_ACK goes straight to the source address, bypassing the
        //  connection's outbound queue - the client is not draining anything yet.
        let ack = connection.handshake_packet(PacketType::ConnectAck).await;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        ack.ser(&mut buf);
        send_pipeline.do_send_packet(from, &buf).await;

        if is_new {
            info!("client {:08x} connected from {:?}", client_id, from);
            handler.on_connect(connection.clone()).await;
            tokio::spawn(Self::delivery_loop(
                registry.clone(),
                handler.clone(),
                connection,
            ));
        }
    }

    /// Application-facing loop for one connection: forwards delivered packets to
    ///  the handler, then deregisters once the connection closes. Removal is
    ///  idempotent with the sweep.
    async fn delivery_loop(registry: Registry, handler: Arc<dyn ServerHandler>, connection: Arc<Connection>) {
        loop {
            match connection.receive().await {
                Ok(packet) => handler.on_message(connection.clone(), packet).await,
                Err(_) => break,
            }
        }

        let client_id = connection.client_id();
        {
            let mut registry_guard = registry.write().await;
            // the entry may already belong to a successor connection
            if let Some(current) = registry_guard.get(&client_id) {
                if Arc::ptr_eq(current, &connection) {
                    registry_guard.remove(&client_id);
                }
            }
        }

        debug!("client {:08x} disconnected", client_id);
        handler.on_disconnect(connection).await;
    }

    /// Garbage-collect connections that stopped being live: closed ones, and
    ///  ones whose peer has been silent past the inactivity timeout.
    async fn sweep_loop(config: Arc<RudpConfig>, registry: Registry) {
        let mut ticker = interval(config.sweep_interval);

        loop {
            ticker.tick().await;

            let snapshot: Vec<(u32, Arc<Connection>)> = registry
                .read()
                .await
                .iter()
                .map(|(&id, c)| (id, c.clone()))
                .collect();

            for (client_id, connection) in snapshot {
                if connection.is_connected().await {
                    continue;
                }

                debug!("sweeping inactive client {:08x}", client_id);
                connection.close().await;

                let mut registry_guard = registry.write().await;
                if let Some(current) = registry_guard.get(&client_id) {
                    if Arc::ptr_eq(current, &connection) {
                        registry_guard.remove(&client_id);
                    }
                }
            }
        }
    }
}
