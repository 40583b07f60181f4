//! A reliable datagram transport layered on UDP, keeping UDP's message
//!  boundaries and small per-datagram overhead while adding selectable
//!  per-message delivery guarantees. The target workload is latency-sensitive,
//!  high-rate small messages - real-time multiplayer games being the canonical
//!  case.
//!
//! ## Design goals
//!
//! * One UDP socket per endpoint, shared by all connections
//!   * the server demultiplexes by a client id embedded in every packet, not by
//!     source address, so peers behind NATs survive port rebinding
//! * The abstraction is sending / receiving *packets* (defined-length chunks of
//!   data, one per datagram) - never a byte stream
//! * Four delivery modes, chosen per message:
//!   * `Unreliable` - fire and forget
//!   * `UnreliableOrdered` - late packets are dropped, the newest wins
//!   * `Reliable` - retransmitted until acknowledged (at-least-once; duplicates
//!     may surface)
//!   * `ReliableOrdered` - retransmitted and buffered for gap-free in-order
//!     delivery
//! * Acknowledgements are piggybacked on every packet: the latest remote
//!   sequence plus a 32-bit bitfield covering the sequences before it, so an
//!   active conversation needs no dedicated ack traffic
//! * A fixed retransmission budget instead of congestion control - when the
//!   budget is spent the packet is abandoned, because a stalled game update is
//!   worse than a lost one
//! * Payloads must fit in a single datagram; there is no fragmentation and no
//!   reassembly
//!
//! ## Header
//!
//! Packet header (inside a UDP datagram) - all numbers little-endian:
//! ```ascii
//! 0:  packet type (u8): 0 DATA, 1 CONNECT, 2 CONNECT_ACK, 3 DISCONNECT
//! 1:  client id (u32): random token generated by the client, the server's
//!      demultiplexing key
//! 5:  sequence (u16): per-connection send counter, wrapping
//! 7:  ack (u16): the latest peer sequence the sender has seen
//! 9:  ack bits (u32): bit i acknowledges sequence `ack - (i+1)`
//! 13: delivery mode (u8)
//! 14: payload length (u16)
//! 16: payload (up to 1384 bytes)
//! ```
//!
//! There is no version byte and no checksum beyond UDP's own. Handshake packets
//!  (CONNECT / CONNECT_ACK / DISCONNECT) carry an empty payload and zeroed
//!  sequence and ack fields.
//!
//! ## Connection lifecycle
//!
//! A client generates its id, sends CONNECT, and waits (with a bounded
//!  deadline) for a CONNECT_ACK echoing that id; the server allocates the
//!  connection when it first sees the id. Either side may send DISCONNECT; the
//!  server additionally sweeps connections that have been silent past the
//!  inactivity timeout. No state survives the process.

mod client;
mod config;
mod connection;
mod error;
mod packet;
mod send_pipeline;
mod sequence;
mod server;

pub use client::{Client, ClientHandler};
pub use config::RudpConfig;
pub use connection::Connection;
pub use error::RudpError;
pub use packet::{DeliveryMode, Packet, PacketType, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD};
pub use sequence::SequenceNumber;
pub use server::{Server, ServerHandler};
