use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{FRAME_PREFIX, HELLO_MAGIC, MAX_FRAME_PAYLOAD};
use crate::error::ProtoError;

/// Frame kinds exchanged over a dispatch session.
///
/// Wire layout of a frame:
/// - 0      `FRAME_PREFIX` (always 0x00)
/// - 1      kind tag
/// - 2..10  `HELLO_MAGIC` (HELLO frames only)
/// - next 2 payload length (u16 big-endian)
/// - rest   payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Anything with an unrecognized kind tag. Never encoded.
    Invalid,
    /// Client -> server. Payload is the namespace name (possibly empty).
    Hello,
    /// Server -> client handshake reply. Payload is the server hostname,
    /// treated as opaque bytes.
    Ack,
    Ping,
    Pong,
    /// Opaque application blob being relayed.
    Pkt,
    /// Either side requests an orderly disconnect.
    Bye,
}

impl FrameKind {
    pub const fn tag(self) -> u8 {
        match self {
            FrameKind::Invalid => 0x00,
            FrameKind::Hello => 0x01,
            FrameKind::Ack => 0x02,
            FrameKind::Ping => 0x03,
            FrameKind::Pong => 0x04,
            FrameKind::Pkt => 0x05,
            FrameKind::Bye => 0x06,
        }
    }

    pub const fn from_tag(tag: u8) -> FrameKind {
        match tag {
            0x01 => FrameKind::Hello,
            0x02 => FrameKind::Ack,
            0x03 => FrameKind::Ping,
            0x04 => FrameKind::Pong,
            0x05 => FrameKind::Pkt,
            0x06 => FrameKind::Bye,
            _ => FrameKind::Invalid,
        }
    }
}

/// A fully assembled frame. Owns its payload; safe to move across tasks.
///
/// The raw kind tag is preserved so that frames with unknown tags can be
/// reported (`kind() == Invalid`) without losing what was actually seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    tag: u8,
    payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Bytes) -> Frame {
        Frame {
            tag: kind.tag(),
            payload,
        }
    }

    pub(crate) fn from_raw(tag: u8, payload: Bytes) -> Frame {
        Frame { tag, payload }
    }

    pub fn kind(&self) -> FrameKind {
        FrameKind::from_tag(self.tag)
    }

    pub fn raw_tag(&self) -> u8 {
        self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// Encode a frame for the wire.
///
/// Every kind carries the u16 length field; HELLO additionally embeds
/// `HELLO_MAGIC` between the kind tag and the length.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Result<Bytes, ProtoError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge(payload.len()));
    }

    let magic_len = if kind == FrameKind::Hello {
        HELLO_MAGIC.len()
    } else {
        0
    };

    let mut buf = BytesMut::with_capacity(2 + magic_len + 2 + payload.len());
    buf.put_u8(FRAME_PREFIX);
    buf.put_u8(kind.tag());
    if kind == FrameKind::Hello {
        buf.put_slice(&HELLO_MAGIC);
    }
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}
