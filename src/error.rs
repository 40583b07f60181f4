use thiserror::Error;

/// Errors surfaced by the transport.
///
/// Malformed datagrams and packets from unknown client ids are *not* represented
///  here - they are dropped silently (with a debug log) because surfacing an error
///  per bad datagram would overwhelm observability on a datagram protocol.
#[derive(Error, Debug)]
pub enum RudpError {
    /// Datagram shorter than the header, or shorter than the declared payload length
    #[error("invalid packet format")]
    InvalidPacket,

    /// Application payload exceeds [`MAX_PAYLOAD`](crate::packet::MAX_PAYLOAD)
    #[error("payload of {0} bytes exceeds maximum size")]
    PacketTooLarge(usize),

    /// Operation attempted on a closed connection, or `receive` woken by close
    #[error("connection is closed")]
    ConnectionClosed,

    /// Handshake did not complete within the deadline
    #[error("operation timed out")]
    Timeout,

    /// Outbound queue saturated on send
    #[error("send buffer is full")]
    BufferFull,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// One or more per-connection failures during a broadcast, keyed by client id.
    /// A failure against one connection never prevents sends to the others.
    #[error("broadcast failed for {} connection(s)", .0.len())]
    Broadcast(Vec<(u32, RudpError)>),
}
