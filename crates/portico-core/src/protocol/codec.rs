//! Wire framing for control messages.
//!
//! Format: 4-byte little-endian payload length, 8-byte little-endian
//! sequence number, payload. The sequence increases by one per frame in
//! each direction; after a rebind the sender replays retained frames and
//! the receiver drops any sequence it has already seen.
//!
//! Decoding is incremental: partial input returns `Ok(None)` and leaves
//! the buffer untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};

/// Length of the frame header (u32 length + u64 sequence).
pub const FRAME_HEADER_LEN: usize = 12;

/// One decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Per-direction sequence number.
    pub seq: u64,
    /// Opaque payload; the owner parses it.
    pub payload: Bytes,
}

/// Length-prefixed, sequence-numbered frame codec.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a payload into a complete frame.
    pub fn encode(seq: u64, payload: &[u8]) -> Result<Bytes> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Codec {
                message: format!(
                    "message too large: {} bytes (max {})",
                    payload.len(),
                    MAX_MESSAGE_SIZE
                ),
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_u64_le(seq);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` and advances the buffer on success,
    /// `Ok(None)` when more data is needed, `Err` on an oversized length.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::Codec {
                message: format!("frame length {} exceeds maximum {}", len, MAX_MESSAGE_SIZE),
            });
        }

        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(4);
        let seq = buf.get_u64_le();
        let payload = buf.split_to(len).freeze();

        Ok(Some(Frame { seq, payload }))
    }
}
