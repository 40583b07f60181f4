use crate::error::RudpError;
use crate::sequence::SequenceNumber;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

/// Total size of a packet on the wire, header included.
pub const MAX_PACKET_SIZE: usize = 1400;
/// Fixed header size.
pub const HEADER_SIZE: usize = 16;
/// Maximum application payload per packet. Bigger payloads are rejected - this
///  protocol does not fragment; chunking is the application's responsibility.
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - HEADER_SIZE;

#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Connect = 1,
    ConnectAck = 2,
    Disconnect = 3,
}

/// Per-packet delivery guarantee selector.
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum DeliveryMode {
    Unreliable = 0,
    UnreliableOrdered = 1,
    Reliable = 2,
    ReliableOrdered = 3,
}

/// A single protocol packet.
///
/// Wire layout, all multi-byte integers little-endian:
/// ```ascii
/// 0:  packet type (u8)
/// 1:  client id (u32) - the sender's demultiplexing token
/// 5:  sequence (u16, wrapping)
/// 7:  ack (u16) - latest remote sequence observed by the sender
/// 9:  ack bits (u32) - bit i set means `ack - (i+1)` was received
/// 13: delivery mode (u8)
/// 14: payload length (u16)
/// 16: payload
/// ```
///
/// There is no checksum beyond UDP's own, and no version byte.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub packet_type: PacketType,
    pub client_id: u32,
    pub sequence: SequenceNumber,
    pub ack: SequenceNumber,
    pub ack_bits: u32,
    pub mode: DeliveryMode,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Handshake request. Empty payload, zeroed sequence/ack fields.
    pub fn connect(client_id: u32) -> Packet {
        Self::handshake(PacketType::Connect, client_id)
    }

    /// Handshake response, carrying the same client id as the request.
    pub fn connect_ack(client_id: u32) -> Packet {
        Self::handshake(PacketType::ConnectAck, client_id)
    }

    /// Best-effort teardown notification.
    pub fn disconnect(client_id: u32) -> Packet {
        Self::handshake(PacketType::Disconnect, client_id)
    }

    fn handshake(packet_type: PacketType, client_id: u32) -> Packet {
        Packet {
            packet_type,
            client_id,
            sequence: SequenceNumber::ZERO,
            ack: SequenceNumber::ZERO,
            ack_bits: 0,
            mode: DeliveryMode::Unreliable,
            payload: Vec::new(),
        }
    }

    /// true iff this packet requires acknowledgement and retransmission
    pub fn is_reliable(&self) -> bool {
        matches!(self.mode, DeliveryMode::Reliable | DeliveryMode::ReliableOrdered)
    }

    /// true iff this packet must be delivered in sequence order
    pub fn is_ordered(&self) -> bool {
        matches!(
            self.mode,
            DeliveryMode::UnreliableOrdered | DeliveryMode::ReliableOrdered
        )
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);

        buf.put_u8(self.packet_type as u8);
        buf.put_u32_le(self.client_id);
        buf.put_u16_le(self.sequence.to_raw());
        buf.put_u16_le(self.ack.to_raw());
        buf.put_u32_le(self.ack_bits);
        buf.put_u8(self.mode as u8);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Packet, RudpError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(RudpError::InvalidPacket);
        }

        let packet_type =
            PacketType::try_from(buf.get_u8()).map_err(|_| RudpError::InvalidPacket)?;
        let client_id = buf.get_u32_le();
        let sequence = SequenceNumber::from_raw(buf.get_u16_le());
        let ack = SequenceNumber::from_raw(buf.get_u16_le());
        let ack_bits = buf.get_u32_le();
        let mode = DeliveryMode::try_from(buf.get_u8()).map_err(|_| RudpError::InvalidPacket)?;
        let payload_len = buf.get_u16_le() as usize;

        if buf.remaining() < payload_len {
            return Err(RudpError::InvalidPacket);
        }
        let mut payload = vec![0u8; payload_len];
        buf.copy_to_slice(&mut payload);

        Ok(Packet {
            packet_type,
            client_id,
            sequence,
            ack,
            ack_bits,
            mode,
            payload,
        })
    }
}
