use crate::config::RudpConfig;
use crate::error::RudpError;
use crate::packet::{DeliveryMode, Packet, PacketType, MAX_PACKET_SIZE, MAX_PAYLOAD};
use crate::send_pipeline::SendPipeline;
use crate::sequence::SequenceNumber;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, trace};

/// A reliable packet retained until the peer acknowledges it (or the retry
///  budget runs out). Attempt count and last-sent time are bookkeeping on this
///  entry, never on the wire.
struct PendingPacket {
    packet: Packet,
    attempts: u32,
    last_sent: Instant,
}

struct ConnectionInner {
    remote_addr: SocketAddr,

    /// next sequence to assign to an outgoing packet
    local_sequence: SequenceNumber,
    /// highest remote sequence observed; piggybacked as the `ack` field on every
    ///  outgoing packet. Serves acknowledgement generation only - ordered
    ///  delivery has its own cursor below.
    remote_sequence: SequenceNumber,
    /// bit i set means `remote_sequence - (i+1)` was received
    ack_bits: u32,

    /// The delivery cursor for the ordered modes: the last ordered sequence
    ///  handed to the application. Next expected is `ordered_cursor + 1`.
    ///  Kept separate from `remote_sequence` - a newer packet must advance the
    ///  ack state immediately, while the ordered cursor may only move along the
    ///  contiguous prefix.
    ordered_cursor: SequenceNumber,

    /// Reliable packets awaiting acknowledgement, keyed by their sequence.
    ///  NB: the key wraps after 65536 sends; an overwrite would need a full wrap
    ///  within the ~500ms retry budget, far beyond practical send rates.
    pending_acks: FxHashMap<SequenceNumber, PendingPacket>,
    /// Ordered packets received ahead of the cursor, keyed by sequence.
    ///  Every entry is strictly after `ordered_cursor` at insert time.
    ordered_buffer: FxHashMap<SequenceNumber, Packet>,

    last_received: Instant,
    last_sent: Instant,
    closed: bool,

    /// Dropping these on close lets the inbound receiver drain and then report
    ///  closure, and terminates the sender loop.
    inbound_tx: Option<mpsc::Sender<Packet>>,
    outbound_tx: Option<mpsc::Sender<Packet>>,
}

impl ConnectionInner {
    fn deliver(&self, packet: Packet, overflow: &AtomicU64) {
        if let Some(tx) = &self.inbound_tx {
            if tx.try_send(packet).is_err() {
                overflow.fetch_add(1, Ordering::Relaxed);
                debug!("inbound queue full - dropping delivery");
            }
        }
    }

    /// hand out buffered ordered packets as long as they are consecutive
    fn drain_ordered(&mut self, overflow: &AtomicU64) {
        loop {
            let next = self.ordered_cursor.next();
            match self.ordered_buffer.remove(&next) {
                Some(packet) => {
                    self.ordered_cursor = next;
                    self.deliver(packet, overflow);
                }
                None => break,
            }
        }
    }
}

/// Per-peer connection state: the reliability engine.
///
/// Three background activities cooperate around a single per-connection lock:
///  the sender loop (drains the outbound queue onto the socket), the
///  retransmission loop (periodic sweep over unacknowledged reliable packets),
///  and packet ingestion via [`Connection::handle_incoming`], driven by the
///  endpoint's socket receive loop. The application reads delivered packets
///  through [`Connection::receive`].
pub struct Connection {
    config: Arc<RudpConfig>,
    client_id: u32,
    inner: Arc<RwLock<ConnectionInner>>,
    send_pipeline: Arc<SendPipeline>,

    inbound_rx: Mutex<mpsc::Receiver<Packet>>,
    outbound_rx: std::sync::Mutex<Option<mpsc::Receiver<Packet>>>,
    inbound_overflow: AtomicU64,
    loop_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for handle in self.loop_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Connection {
    pub fn new(
        config: Arc<RudpConfig>,
        send_pipeline: Arc<SendPipeline>,
        remote_addr: SocketAddr,
        client_id: u32,
    ) -> Connection {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);

        let now = Instant::now();
        let inner = ConnectionInner {
            remote_addr,
            local_sequence: SequenceNumber::ZERO,
            remote_sequence: SequenceNumber::ZERO,
            ack_bits: 0,
            ordered_cursor: SequenceNumber::ZERO,
            pending_acks: FxHashMap::default(),
            ordered_buffer: FxHashMap::default(),
            last_received: now,
            last_sent: now,
            closed: false,
            inbound_tx: Some(inbound_tx),
            outbound_tx: Some(outbound_tx),
        };

        Connection {
            config,
            client_id,
            inner: Arc::new(RwLock::new(inner)),
            send_pipeline,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_rx: std::sync::Mutex::new(Some(outbound_rx)),
            inbound_overflow: AtomicU64::new(0),
            loop_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start the sender and retransmission loops. Separate from construction so
    ///  the endpoint controls when traffic may flow.
    pub fn spawn_loops(&self) {
        let mut handles = self.loop_handles.lock().unwrap();
        if !handles.is_empty() {
            return;
        }

        let Some(outbound_rx) = self.outbound_rx.lock().unwrap().take() else {
            return;
        };

        handles.push(tokio::spawn(Self::sender_loop(
            self.inner.clone(),
            self.send_pipeline.clone(),
            outbound_rx,
        )));
        handles.push(tokio::spawn(Self::retransmission_loop(
            self.config.clone(),
            self.inner.clone(),
        )));
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub async fn remote_addr(&self) -> SocketAddr {
        self.inner.read().await.remote_addr
    }

    /// Adopt a new peer address (NAT rebinding / roaming). Subsequent outbound
    ///  packets target the new address; no handshake is required.
    pub async fn set_remote_addr(&self, addr: SocketAddr) {
        let mut inner = self.inner.write().await;
        if inner.remote_addr != addr {
            debug!(
                "client {:08x} moved from {:?} to {:?}",
                self.client_id, inner.remote_addr, addr
            );
            inner.remote_addr = addr;
        }
    }

    /// Number of deliveries dropped because the inbound queue was full. For
    ///  reliable modes this is where transport-level reliability ends: a slow
    ///  consumer loses packets here, not on the network.
    pub fn inbound_overflow(&self) -> u64 {
        self.inbound_overflow.load(Ordering::Relaxed)
    }

    /// Build this connection's handshake packet. The first handshake emission
    ///  occupies sequence 0 of the outgoing stream (the wire fields stay zeroed),
    ///  so data packets start at sequence 1 - which is exactly where the peer's
    ///  ordered cursor begins. A re-sent handshake does not consume another
    ///  sequence.
    pub async fn handshake_packet(&self, packet_type: PacketType) -> Packet {
        let mut inner = self.inner.write().await;
        if inner.local_sequence == SequenceNumber::ZERO {
            inner.local_sequence = inner.local_sequence.next();
        }

        match packet_type {
            PacketType::Connect => Packet::connect(self.client_id),
            PacketType::ConnectAck => Packet::connect_ack(self.client_id),
            PacketType::Disconnect => Packet::disconnect(self.client_id),
            PacketType::Data => unreachable!("data packets go through send()"),
        }
    }

    /// Queue a payload for transmission with the chosen delivery mode.
    ///
    /// Does not touch the network: the packet is stamped with the current
    ///  sequence and acknowledgement state and enqueued for the sender loop.
    pub async fn send(&self, payload: &[u8], mode: DeliveryMode) -> Result<(), RudpError> {
        let mut inner = self.inner.write().await;

        if inner.closed {
            return Err(RudpError::ConnectionClosed);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(RudpError::PacketTooLarge(payload.len()));
        }

        let outbound_tx = inner.outbound_tx.clone().ok_or(RudpError::ConnectionClosed)?;
        // reserve the queue slot before mutating sequence state, so a full
        //  outbound queue leaves the connection untouched
        let permit = match outbound_tx.try_reserve() {
            Ok(permit) => permit,
            Err(_) => return Err(RudpError::BufferFull),
        };

        let packet = Packet {
            packet_type: PacketType::Data,
            client_id: self.client_id,
            sequence: inner.local_sequence,
            ack: inner.remote_sequence,
            ack_bits: inner.ack_bits,
            mode,
            payload: payload.to_vec(),
        };

        inner.local_sequence = inner.local_sequence.next();

        if packet.is_reliable() {
            trace!("tracking reliable packet #{} for acknowledgement", packet.sequence);
            inner.pending_acks.insert(
                packet.sequence,
                PendingPacket {
                    packet: packet.clone(),
                    attempts: 0,
                    last_sent: Instant::now(),
                },
            );
        }

        permit.send(packet);
        Ok(())
    }

    /// Next delivered packet. Suspends until one is available; once the
    ///  connection is closed *and* the inbound queue is drained, fails with
    ///  `ConnectionClosed`.
    pub async fn receive(&self) -> Result<Packet, RudpError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or(RudpError::ConnectionClosed)
    }

    /// Ingest a DATA packet addressed to this connection: process its
    ///  acknowledgement state, refresh the receive window, and route the payload
    ///  to the application (directly or through the ordered buffer).
    pub async fn handle_incoming(&self, packet: Packet) {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return;
        }

        inner.last_received = Instant::now();

        // acknowledgements piggybacked on the packet: the ack field plus one bit
        //  per earlier sequence. Entries already acknowledged are silent no-ops.
        inner.pending_acks.remove(&packet.ack);
        for i in 0..32u16 {
            if packet.ack_bits & (1u32 << i) != 0 {
                inner.pending_acks.remove(&packet.ack.minus(i + 1));
            }
        }

        if packet.sequence.is_after(inner.remote_sequence) {
            let diff = packet.sequence.distance_from(inner.remote_sequence) as u32;
            if diff > 32 {
                // the whole bitfield window was skipped
                inner.ack_bits = 0;
            } else {
                // previous bits move down by the advance; the old latest gets
                //  the bit just below the new latest
                inner.ack_bits = inner.ack_bits.checked_shl(diff).unwrap_or(0) | (1 << (diff - 1));
            }
            inner.remote_sequence = packet.sequence;
        } else if inner.remote_sequence != packet.sequence {
            // late arrival below the latest: record it if it falls inside the window
            let diff = inner.remote_sequence.distance_from(packet.sequence) as u32;
            if diff <= 32 {
                inner.ack_bits |= 1 << (diff - 1);
            }
        }

        if packet.is_ordered() {
            if !packet.sequence.is_after(inner.ordered_cursor) {
                // duplicate or late: already delivered or superseded
                trace!(
                    "ordered packet #{} at or behind cursor {} - discarding",
                    packet.sequence,
                    inner.ordered_cursor
                );
            } else if packet.mode == DeliveryMode::UnreliableOrdered {
                // unreliable-ordered never waits for a gap to fill: jump the
                //  cursor, drop whatever it jumped over
                inner.ordered_cursor = packet.sequence;
                inner.deliver(packet, &self.inbound_overflow);
                let cursor = inner.ordered_cursor;
                inner.ordered_buffer.retain(|seq, _| seq.is_after(cursor));
                inner.drain_ordered(&self.inbound_overflow);
            } else {
                inner.ordered_buffer.insert(packet.sequence, packet);
                inner.drain_ordered(&self.inbound_overflow);
            }
        } else {
            // unordered duplicates are delivered again: at-least-once semantics
            inner.deliver(packet, &self.inbound_overflow);
        }
    }

    /// `true` while the connection is open and the peer has been heard from
    ///  within the inactivity timeout.
    pub async fn is_connected(&self) -> bool {
        let inner = self.inner.read().await;
        !inner.closed && inner.last_received.elapsed() < self.config.inactivity_timeout
    }

    /// Idempotent. Wakes any pending `receive` (after the inbound queue drains)
    ///  and stops the background loops; outbound packets still in flight may or
    ///  may not be transmitted.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.inbound_tx = None;
            inner.outbound_tx = None;
        }

        for handle in self.loop_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Drains the outbound queue onto the socket, stamping transmission
    ///  bookkeeping on the way out. Terminates once the outbound sender is
    ///  dropped on close.
    async fn sender_loop(
        inner: Arc<RwLock<ConnectionInner>>,
        send_pipeline: Arc<SendPipeline>,
        mut outbound_rx: mpsc::Receiver<Packet>,
    ) {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);

        while let Some(packet) = outbound_rx.recv().await {
            let remote_addr = {
                let mut inner = inner.write().await;
                let now = Instant::now();
                inner.last_sent = now;
                if let Some(pending) = inner.pending_acks.get_mut(&packet.sequence) {
                    pending.attempts += 1;
                    pending.last_sent = now;
                }
                inner.remote_addr
            };

            buf.clear();
            packet.ser(&mut buf);
            send_pipeline.do_send_packet(remote_addr, &buf).await;
        }

        trace!("sender loop terminating");
    }

    /// Periodic sweep over unacknowledged reliable packets: re-enqueue overdue
    ///  ones, drop those whose retry budget is exhausted. Budget exhaustion is
    ///  silent - best-effort datagram semantics - and the connection stays
    ///  usable until its liveness clock expires.
    async fn retransmission_loop(config: Arc<RudpConfig>, inner: Arc<RwLock<ConnectionInner>>) {
        let mut ticker = interval(config.retransmission_timeout);

        loop {
            ticker.tick().await;

            let mut inner = inner.write().await;
            if inner.closed {
                return;
            }

            let now = Instant::now();
            let overdue: Vec<SequenceNumber> = inner
                .pending_acks
                .iter()
                .filter(|(_, p)| now.duration_since(p.last_sent) > config.retransmission_timeout)
                .map(|(&seq, _)| seq)
                .collect();

            for seq in overdue {
                if inner.pending_acks[&seq].attempts >= config.max_retransmissions {
                    debug!("retry budget exhausted for packet #{} - dropping", seq);
                    inner.pending_acks.remove(&seq);
                    continue;
                }

                let Some(outbound_tx) = inner.outbound_tx.as_ref() else {
                    return;
                };
                // the original sequence is preserved so the receiver correlates
                //  this copy with any earlier one
                let packet = inner.pending_acks[&seq].packet.clone();
                if outbound_tx.try_send(packet).is_err() {
                    trace!("outbound queue full - packet #{} skips this round", seq);
                }
            }
        }
    }
}
