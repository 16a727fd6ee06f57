//! Bus envelope codec.
//!
//! Envelopes wrap a relayed frame with its source client id and
//! namespace so every dispatch instance subscribed to the exchange can
//! route it without further context:
//!
//! `source[22] | nsLen:u16be | ns[nsLen] | payloadLen:u16be | payload[payloadLen]`

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::SOURCE_LEN;
use crate::error::ProtoError;

/// A parsed envelope. Accessors borrow from the underlying buffer.
#[derive(Debug, Clone)]
pub struct Envelope {
    data: Bytes,
    ns_len: usize,
    payload_len: usize,
}

impl Envelope {
    /// Validate and wrap a blob received from the bus.
    ///
    /// Foreign processes share the exchange, so this is checked end to
    /// end: both length fields must match the trailing bytes exactly.
    pub fn parse(data: Bytes) -> Result<Envelope, ProtoError> {
        if data.len() < SOURCE_LEN + 2 {
            return Err(ProtoError::EnvelopeTooShort(data.len()));
        }
        let ns_len = u16::from_be_bytes([data[SOURCE_LEN], data[SOURCE_LEN + 1]]) as usize;

        let payload_len_at = SOURCE_LEN + 2 + ns_len;
        if data.len() < payload_len_at + 2 {
            return Err(ProtoError::EnvelopeTooShort(data.len()));
        }
        let payload_len =
            u16::from_be_bytes([data[payload_len_at], data[payload_len_at + 1]]) as usize;

        if data.len() != payload_len_at + 2 + payload_len {
            return Err(ProtoError::EnvelopeLengthMismatch);
        }

        std::str::from_utf8(&data[..SOURCE_LEN]).map_err(|_| ProtoError::EnvelopeEncoding)?;
        std::str::from_utf8(&data[SOURCE_LEN + 2..payload_len_at])
            .map_err(|_| ProtoError::EnvelopeEncoding)?;

        Ok(Envelope {
            data,
            ns_len,
            payload_len,
        })
    }

    pub fn source(&self) -> &str {
        // Checked in parse().
        std::str::from_utf8(&self.data[..SOURCE_LEN]).expect("validated utf-8")
    }

    pub fn namespace(&self) -> &str {
        std::str::from_utf8(&self.data[SOURCE_LEN + 2..SOURCE_LEN + 2 + self.ns_len])
            .expect("validated utf-8")
    }

    pub fn payload(&self) -> &[u8] {
        let at = SOURCE_LEN + 2 + self.ns_len + 2;
        &self.data[at..at + self.payload_len]
    }

    /// Payload as an owned slice of the envelope buffer, without copying.
    pub fn into_payload(self) -> Bytes {
        let at = SOURCE_LEN + 2 + self.ns_len + 2;
        self.data.slice(at..at + self.payload_len)
    }
}

/// Build an envelope for publication.
///
/// Panics if `source` is not exactly [`SOURCE_LEN`] bytes: ids come from
/// our own generator, so anything else is a bug in the caller, not a
/// runtime condition.
pub fn make_envelope(source: &str, namespace: &str, payload: &[u8]) -> Bytes {
    assert_eq!(
        source.len(),
        SOURCE_LEN,
        "envelope source must be exactly {SOURCE_LEN} bytes"
    );
    assert!(namespace.len() <= u16::MAX as usize);
    assert!(payload.len() <= u16::MAX as usize);

    let mut buf = BytesMut::with_capacity(SOURCE_LEN + 2 + namespace.len() + 2 + payload.len());
    buf.put_slice(source.as_bytes());
    buf.put_u16(namespace.len() as u16);
    buf.put_slice(namespace.as_bytes());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}
