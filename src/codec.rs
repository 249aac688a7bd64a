// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! Wire framing for the TinyMQ protocol: `type:u8 | flags:u8 | len:u16be | payload`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size representable by the 16-bit length prefix.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// The closed enumeration of TinyMQ packet types. Values are fixed for wire
/// compatibility with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PacketType {
    /// First connection; payload is the UTF-8 client id.
    Conn,
    /// Acknowledgement of [`PacketType::Conn`].
    ConnAck,
    /// Publish a message on a topic.
    Pub,
    /// Acknowledgement of [`PacketType::Pub`].
    PubAck,
    /// Subscribe to a topic.
    Sub,
    /// Acknowledgement of [`PacketType::Sub`].
    SubAck,
    /// Unsubscribe from a topic.
    Unsub,
    /// Acknowledgement of [`PacketType::Unsub`].
    UnsubAck,
    /// Request the list of published topics.
    TopicReq,
    /// Response to [`PacketType::TopicReq`].
    TopicResp,
    /// Request administration of a remote topic.
    AdminReq,
    /// Synchronous accept/reject of [`PacketType::AdminReq`] (success/failure in flags).
    AdminReqAck,
    /// Broker-pushed notification of an incoming admin request or command.
    AdminNotify,
    /// Owner's approve/reject response to an admin request.
    AdminResponse,
    /// Broker-pushed result of a previously submitted admin request (approval/rejection/revocation).
    AdminResult,
    /// Request the list of pending incoming admin requests (owner side).
    AdminListReq,
    /// Response to [`PacketType::AdminListReq`].
    AdminListResp,
    /// Reserved response packet type for admin responses (wire-compatible slot).
    AdminResp,
    /// Request the requester's own outstanding admin requests.
    MyAdminReq,
    /// Response to [`PacketType::MyAdminReq`].
    MyAdminResp,
    /// Request the client's own topics.
    MyTopicsReq,
    /// Response to [`PacketType::MyTopicsReq`].
    MyTopicsResp,
    /// Request topics on which this client has been granted admin.
    MyAdminTopicsReq,
    /// Response to [`PacketType::MyAdminTopicsReq`].
    MyAdminTopicsResp,
    /// Resign administration of a topic.
    AdminResign,
    /// Acknowledgement of [`PacketType::AdminResign`].
    AdminResignAck,
    /// Request the sensor set configured for a topic.
    TopicSensorsReq,
    /// Response to [`PacketType::TopicSensorsReq`].
    TopicSensorsResp,
    /// Confirmation that a remote sensor command took effect.
    SensorStatusResp,
    /// A packet type not recognised by this version of the protocol. Still
    /// carries a valid length and is skipped by the caller.
    Unknown(u8),
}

impl PacketType {
    /// Returns the wire value for this packet type.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            PacketType::Conn => 0x01,
            PacketType::ConnAck => 0x02,
            PacketType::Pub => 0x03,
            PacketType::PubAck => 0x04,
            PacketType::Sub => 0x05,
            PacketType::SubAck => 0x06,
            PacketType::Unsub => 0x07,
            PacketType::UnsubAck => 0x08,
            PacketType::TopicReq => 0x09,
            PacketType::TopicResp => 0x0A,
            PacketType::AdminReq => 0x0B,
            PacketType::AdminReqAck => 0x0C,
            PacketType::AdminNotify => 0x0D,
            PacketType::AdminResponse => 0x0E,
            PacketType::AdminResult => 0x0F,
            PacketType::AdminListReq => 0x10,
            PacketType::AdminListResp => 0x11,
            PacketType::AdminResp => 0x12,
            PacketType::MyAdminReq => 0x13,
            PacketType::MyAdminResp => 0x14,
            PacketType::MyTopicsReq => 0x20,
            PacketType::MyTopicsResp => 0x21,
            PacketType::MyAdminTopicsReq => 0x22,
            PacketType::MyAdminTopicsResp => 0x23,
            PacketType::AdminResign => 0x24,
            PacketType::AdminResignAck => 0x25,
            PacketType::TopicSensorsReq => 0x26,
            PacketType::TopicSensorsResp => 0x27,
            PacketType::SensorStatusResp => 0x35,
            PacketType::Unknown(b) => b,
        }
    }

    /// Parses a wire byte into a packet type, never failing: an unrecognised
    /// byte becomes [`PacketType::Unknown`].
    #[must_use]
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PacketType::Conn,
            0x02 => PacketType::ConnAck,
            0x03 => PacketType::Pub,
            0x04 => PacketType::PubAck,
            0x05 => PacketType::Sub,
            0x06 => PacketType::SubAck,
            0x07 => PacketType::Unsub,
            0x08 => PacketType::UnsubAck,
            0x09 => PacketType::TopicReq,
            0x0A => PacketType::TopicResp,
            0x0B => PacketType::AdminReq,
            0x0C => PacketType::AdminReqAck,
            0x0D => PacketType::AdminNotify,
            0x0E => PacketType::AdminResponse,
            0x0F => PacketType::AdminResult,
            0x10 => PacketType::AdminListReq,
            0x11 => PacketType::AdminListResp,
            0x12 => PacketType::AdminResp,
            0x13 => PacketType::MyAdminReq,
            0x14 => PacketType::MyAdminResp,
            0x20 => PacketType::MyTopicsReq,
            0x21 => PacketType::MyTopicsResp,
            0x22 => PacketType::MyAdminTopicsReq,
            0x23 => PacketType::MyAdminTopicsResp,
            0x24 => PacketType::AdminResign,
            0x25 => PacketType::AdminResignAck,
            0x26 => PacketType::TopicSensorsReq,
            0x27 => PacketType::TopicSensorsResp,
            0x35 => PacketType::SensorStatusResp,
            other => PacketType::Unknown(other),
        }
    }
}

/// A decoded TinyMQ frame: packet type, flag byte, and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The frame's packet type.
    pub packet_type: PacketType,
    /// Flag byte. Meaning is packet-type specific (e.g. success/failure for `ADMIN_REQ_ACK`).
    pub flags: u8,
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a new frame.
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            flags,
            payload: payload.into(),
        }
    }
}

/// Outcome of attempting to decode a frame from a buffer.
pub enum DecodeOutcome {
    /// A full frame was decoded; the second field is the number of bytes
    /// consumed from the front of the buffer.
    Frame(Frame, usize),
    /// Not enough bytes are buffered yet to decode a full frame.
    NeedMore,
}

/// Serializes a frame header + payload into wire bytes.
///
/// # Errors
/// Returns an error if `payload` exceeds [`MAX_PAYLOAD_LEN`] bytes.
pub fn encode(packet_type: PacketType, flags: u8, payload: &[u8]) -> crate::error::Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(crate::error::TinyMqErrorKind::Encoding(format!(
            "payload of {} bytes exceeds max frame payload of {MAX_PAYLOAD_LEN}",
            payload.len()
        ))
        .into());
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(packet_type.to_byte());
    buf.put_u8(flags);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Attempts to decode one frame from the front of `buf`.
///
/// An unrecognised packet type byte still decodes successfully (as
/// [`PacketType::Unknown`]) as long as the length prefix is satisfiable; the
/// caller is expected to discard frames of unknown type.
#[must_use]
pub fn decode(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < HEADER_SIZE {
        return DecodeOutcome::NeedMore;
    }
    let packet_type = PacketType::from_byte(buf[0]);
    let flags = buf[1];
    let payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let total_len = HEADER_SIZE + payload_len;
    if buf.len() < total_len {
        return DecodeOutcome::NeedMore;
    }
    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..total_len]);
    DecodeOutcome::Frame(Frame::new(packet_type, flags, payload), total_len)
}

/// Drains as many complete frames as are available from `buf`, advancing the
/// cursor past each one. Used by the connection reader loop.
pub fn decode_all(buf: &mut BytesMut) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        match decode(buf) {
            DecodeOutcome::Frame(frame, consumed) => {
                buf.advance(consumed);
                frames.push(frame);
            }
            DecodeOutcome::NeedMore => break,
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let payload = b"hello world".to_vec();
        let bytes = encode(PacketType::Pub, 0, &payload).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + payload.len());
        match decode(&bytes) {
            DecodeOutcome::Frame(frame, consumed) => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(frame.packet_type.to_byte(), PacketType::Pub.to_byte());
                assert_eq!(frame.flags, 0);
                assert_eq!(&frame.payload[..], &payload[..]);
            }
            DecodeOutcome::NeedMore => panic!("expected a full frame"),
        }
    }

    #[test]
    fn decode_needs_more_on_partial_header() {
        let buf = [0x03, 0x00, 0x00];
        assert!(matches!(decode(&buf), DecodeOutcome::NeedMore));
    }

    #[test]
    fn decode_needs_more_on_partial_payload() {
        let full = encode(PacketType::Sub, 0, b"abcdef").unwrap();
        assert!(matches!(decode(&full[..full.len() - 1]), DecodeOutcome::NeedMore));
    }

    #[test]
    fn unknown_type_still_consumes_full_frame() {
        let bytes = encode(PacketType::Unknown(0x99), 0, b"xyz").unwrap();
        match decode(&bytes) {
            DecodeOutcome::Frame(frame, consumed) => {
                assert_eq!(consumed, bytes.len());
                assert!(matches!(frame.packet_type, PacketType::Unknown(0x99)));
            }
            DecodeOutcome::NeedMore => panic!("expected a full frame"),
        }
    }

    #[test]
    fn decode_all_recovers_concatenated_frames_with_no_residue() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(PacketType::Conn, 0, b"alice").unwrap());
        buf.extend_from_slice(&encode(PacketType::Sub, 0, b"[\"weather\"]").unwrap());
        buf.extend_from_slice(&encode(PacketType::Pub, 0, b"partial-next-tim").unwrap());
        let frames = decode_all(&mut buf);
        assert_eq!(frames.len(), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_all_leaves_trailing_partial_frame_buffered() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(PacketType::Conn, 0, b"alice").unwrap());
        let mut partial = BytesMut::new();
        partial.extend_from_slice(&encode(PacketType::Sub, 0, b"hello").unwrap());
        let cut = partial.len() - 2;
        buf.extend_from_slice(&partial[..cut]);

        let frames = decode_all(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(buf.len(), cut);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(encode(PacketType::Pub, 0, &payload).is_err());
    }
}
