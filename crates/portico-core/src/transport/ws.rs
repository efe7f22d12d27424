//! Server-side WebSocket framing per RFC 6455.
//!
//! Only the pieces the agent needs: the accept-key computation for the
//! HTTP upgrade, an incremental decoder for masked client frames
//! (binary/text with fragmentation, ping, close), and unmasked server
//! frame encoding. No extensions are negotiated, so RSV bits must be
//! zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::WEBSOCKET_MAGIC_GUID;
use crate::error::{Error, Result};

/// Largest accepted single-frame payload (16 MiB).
const MAX_WS_PAYLOAD: usize = 16 * 1024 * 1024;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// Compute the `Sec-WebSocket-Accept` value for a client key (RFC 6455 §4).
pub fn accept_key(client_key: &str) -> String {
    use base64::Engine;
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_MAGIC_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// One decoded inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// A complete data message (text or binary, fragments assembled).
    Data(Bytes),
    /// Ping; the caller must answer with [`encode_pong`].
    Ping(Bytes),
    /// Pong; ignorable.
    Pong,
    /// Close frame; the connection is over.
    Close,
}

/// Incremental decoder for client (masked) frames.
#[derive(Debug, Default)]
pub struct WsDecoder {
    fragments: BytesMut,
    in_fragment: bool,
}

impl WsDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one event from the front of `buf`.
    ///
    /// Returns `Ok(None)` when a full frame has not arrived yet; the
    /// buffer is only consumed for complete frames.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<WsEvent>> {
        loop {
            let Some((frame, consumed)) = parse_frame(buf)? else {
                return Ok(None);
            };
            buf.advance(consumed);

            if frame.opcode >= OPCODE_CLOSE {
                // Control frames may interleave with a fragmented message.
                match frame.opcode {
                    OPCODE_CLOSE => return Ok(Some(WsEvent::Close)),
                    OPCODE_PING => return Ok(Some(WsEvent::Ping(frame.payload))),
                    OPCODE_PONG => return Ok(Some(WsEvent::Pong)),
                    other => {
                        return Err(Error::Protocol {
                            message: format!("unknown websocket control opcode {other:#x}"),
                        });
                    }
                }
            }

            match (frame.opcode, self.in_fragment) {
                (OPCODE_TEXT | OPCODE_BINARY, false) => {
                    if frame.fin {
                        return Ok(Some(WsEvent::Data(frame.payload)));
                    }
                    self.in_fragment = true;
                    self.fragments.extend_from_slice(&frame.payload);
                }
                (OPCODE_CONTINUATION, true) => {
                    self.fragments.extend_from_slice(&frame.payload);
                    if frame.fin {
                        self.in_fragment = false;
                        return Ok(Some(WsEvent::Data(self.fragments.split().freeze())));
                    }
                }
                (OPCODE_CONTINUATION, false) => {
                    return Err(Error::Protocol {
                        message: "continuation frame without a started message".into(),
                    });
                }
                (opcode, true) => {
                    return Err(Error::Protocol {
                        message: format!("data frame {opcode:#x} inside a fragmented message"),
                    });
                }
                (opcode, false) => {
                    return Err(Error::Protocol {
                        message: format!("unknown websocket opcode {opcode:#x}"),
                    });
                }
            }
        }
    }
}

struct RawFrame {
    fin: bool,
    opcode: u8,
    payload: Bytes,
}

/// Parse a complete frame without consuming `buf`; returns the frame and
/// the number of bytes it occupies.
fn parse_frame(buf: &BytesMut) -> Result<Option<(RawFrame, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(Error::Protocol {
            message: "websocket RSV bits set without a negotiated extension".into(),
        });
    }
    let opcode = b0 & 0x0F;

    let masked = b1 & 0x80 != 0;
    if !masked {
        return Err(Error::Protocol {
            message: "client websocket frame is not masked".into(),
        });
    }

    let len7 = (b1 & 0x7F) as usize;
    let (payload_len, len_field) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 2)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len_bytes) as usize, 8)
        }
        n => (n, 0),
    };

    if payload_len > MAX_WS_PAYLOAD {
        return Err(Error::Protocol {
            message: format!("websocket frame of {payload_len} bytes exceeds limit"),
        });
    }
    if opcode >= OPCODE_CLOSE && (!fin || payload_len > 125) {
        return Err(Error::Protocol {
            message: "fragmented or oversized websocket control frame".into(),
        });
    }

    let header_len = 2 + len_field + 4;
    let total = header_len + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mask_off = 2 + len_field;
    let key = [
        buf[mask_off],
        buf[mask_off + 1],
        buf[mask_off + 2],
        buf[mask_off + 3],
    ];
    let mut payload = BytesMut::with_capacity(payload_len);
    payload.extend_from_slice(&buf[header_len..total]);
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }

    Ok(Some((
        RawFrame {
            fin,
            opcode,
            payload: payload.freeze(),
        },
        total,
    )))
}

fn encode_frame(opcode: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 10);
    buf.put_u8(0x80 | opcode);
    match payload.len() {
        n if n < 126 => buf.put_u8(n as u8),
        n if n <= u16::MAX as usize => {
            buf.put_u8(126);
            buf.put_u16(n as u16);
        }
        n => {
            buf.put_u8(127);
            buf.put_u64(n as u64);
        }
    }
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode an unmasked server binary frame.
pub fn encode_binary(payload: &[u8]) -> Bytes {
    encode_frame(OPCODE_BINARY, payload)
}

/// Encode a pong answering the given ping payload.
pub fn encode_pong(payload: &[u8]) -> Bytes {
    encode_frame(OPCODE_PONG, payload)
}

/// Encode an empty close frame.
pub fn encode_close() -> Bytes {
    encode_frame(OPCODE_CLOSE, &[])
}
