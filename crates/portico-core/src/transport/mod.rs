//! Message-framed, resumable byte transport.
//!
//! A [`FramedTransport`] owns an upgraded socket and speaks the control
//! framing of [`crate::protocol::codec`], optionally below a WebSocket
//! layer (browser clients) or directly on the raw stream (native clients
//! that upgraded with `skipWebSocketFrames=true`).
//!
//! The transport is the unit of resumability: outbound frames are
//! retained in a bounded replay window, a dead socket can be replaced
//! with [`FramedTransport::rebind`], and unconsumed inbound bytes can be
//! drained losslessly with [`FramedTransport::read_entire_buffer`] when
//! ownership moves to another component.

pub mod ws;

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::constants::REPLAY_BUFFER_LIMIT;
use crate::error::{Error, Result};
use crate::protocol::{FrameCodec, FRAME_HEADER_LEN};

/// Object-safe byte stream. Blanket-implemented for anything duplex.
pub trait WireStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> WireStream for T {}

/// A stream whose ownership moves between transport owners.
pub type BoxedStream = Box<dyn WireStream>;

/// Framing stack selected at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// Control frames travel inside WebSocket binary frames.
    #[default]
    WebSocket,
    /// Control frames travel directly on the stream.
    Raw,
}

const READ_CHUNK: usize = 16 * 1024;

/// Bounded window of encoded outbound frames kept for replay.
#[derive(Debug, Default)]
struct ReplayBuffer {
    frames: VecDeque<(u64, Bytes)>,
    total: usize,
}

impl ReplayBuffer {
    fn push(&mut self, seq: u64, frame: Bytes) {
        self.total += frame.len();
        self.frames.push_back((seq, frame));
        while self.total > REPLAY_BUFFER_LIMIT {
            if let Some((_, dropped)) = self.frames.pop_front() {
                self.total -= dropped.len();
            } else {
                break;
            }
        }
    }

    fn frames_from(&self, replay_from: u64) -> Vec<Bytes> {
        self.frames
            .iter()
            .filter(|(seq, _)| *seq >= replay_from)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

/// Message-framed transport over one (replaceable) socket.
pub struct FramedTransport {
    mode: FramingMode,
    stream: Option<BoxedStream>,
    ws: ws::WsDecoder,
    /// Undecoded socket bytes (WebSocket mode only).
    socket_in: BytesMut,
    /// Decoded payload bytes not yet consumed as control frames.
    inbound: BytesMut,
    replay: ReplayBuffer,
    next_send_seq: u64,
    last_recv_seq: Option<u64>,
}

impl FramedTransport {
    /// Wrap a freshly upgraded socket. `initial` holds any socket-level
    /// bytes that arrived together with the HTTP request head.
    pub fn new(stream: BoxedStream, mode: FramingMode, initial: Bytes) -> Self {
        let mut socket_in = BytesMut::new();
        let mut inbound = BytesMut::new();
        match mode {
            FramingMode::WebSocket => socket_in.extend_from_slice(&initial),
            FramingMode::Raw => inbound.extend_from_slice(&initial),
        }

        Self {
            mode,
            stream: Some(stream),
            ws: ws::WsDecoder::new(),
            socket_in,
            inbound,
            replay: ReplayBuffer::default(),
            next_send_seq: 0,
            last_recv_seq: None,
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Whether a live socket is currently attached.
    pub fn is_attached(&self) -> bool {
        self.stream.is_some()
    }

    /// Enqueue and send one framed control message.
    ///
    /// While detached, the frame is only retained; it goes out with the
    /// replay on the next [`rebind`](Self::rebind).
    pub async fn send_control(&mut self, payload: &[u8]) -> Result<()> {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        let frame = FrameCodec::encode(seq, payload)?;
        self.replay.push(seq, frame.clone());

        if self.stream.is_some() {
            self.write_framed(&frame).await?;
        }
        Ok(())
    }

    /// Receive the next complete control message payload.
    ///
    /// Replayed frames (sequence already seen) are dropped silently.
    pub async fn recv_control(&mut self) -> Result<Bytes> {
        loop {
            while let Some(frame) = FrameCodec::decode(&mut self.inbound)? {
                if let Some(last) = self.last_recv_seq {
                    if frame.seq <= last {
                        trace!(seq = frame.seq, "dropping replayed control frame");
                        continue;
                    }
                }
                self.last_recv_seq = Some(frame.seq);
                return Ok(frame.payload);
            }
            self.fill_inbound().await?;
        }
    }

    /// Atomically detach all unconsumed decoded inbound bytes.
    pub fn read_entire_buffer(&mut self) -> Bytes {
        self.inbound.split().freeze()
    }

    /// Prepend-feed decoded payload bytes handed over from another
    /// transport (a resume's buffered prefix).
    pub fn feed_inbound(&mut self, buffered: Bytes) {
        self.inbound.extend_from_slice(&buffered);
    }

    /// Drop the current socket and enter the detached state, keeping all
    /// resumable state. A trailing partial inbound frame (the socket died
    /// mid-frame) is discarded; the peer replays it on resume.
    pub fn detach(&mut self) {
        self.stream = None;
        self.socket_in.clear();
        self.ws = ws::WsDecoder::new();

        let mut complete = 0usize;
        loop {
            let rest = &self.inbound[complete..];
            if rest.len() < FRAME_HEADER_LEN {
                break;
            }
            let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if rest.len() < FRAME_HEADER_LEN + len {
                break;
            }
            complete += FRAME_HEADER_LEN + len;
        }
        self.inbound.truncate(complete);
    }

    /// Attach a replacement socket and replay retained outbound frames
    /// with sequence `>= replay_from`.
    pub async fn rebind(&mut self, stream: BoxedStream, replay_from: u64) -> Result<()> {
        self.stream = Some(stream);
        self.socket_in.clear();
        self.ws = ws::WsDecoder::new();

        for frame in self.replay.frames_from(replay_from) {
            self.write_framed(&frame).await?;
        }
        Ok(())
    }

    /// Dispose the transport without closing the socket: ownership of the
    /// stream and all unconsumed inbound bytes moves to the caller.
    ///
    /// In WebSocket mode a partially received frame is discarded; only
    /// whole decoded payloads are handed over.
    pub fn into_parts(mut self) -> (Option<BoxedStream>, Bytes) {
        let leftover = self.inbound.split().freeze();
        (self.stream.take(), leftover)
    }

    async fn fill_inbound(&mut self) -> Result<()> {
        match self.mode {
            FramingMode::Raw => {
                let n = self.read_socket_into_inbound().await?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
                Ok(())
            }
            FramingMode::WebSocket => loop {
                match self.ws.decode(&mut self.socket_in)? {
                    Some(ws::WsEvent::Data(data)) => {
                        self.inbound.extend_from_slice(&data);
                        return Ok(());
                    }
                    Some(ws::WsEvent::Ping(payload)) => {
                        let pong = ws::encode_pong(&payload);
                        self.write_raw(&pong).await?;
                    }
                    Some(ws::WsEvent::Pong) => {}
                    Some(ws::WsEvent::Close) => return Err(Error::ConnectionClosed),
                    None => {
                        let n = self.read_socket_into_socket_in().await?;
                        if n == 0 {
                            return Err(Error::ConnectionClosed);
                        }
                    }
                }
            },
        }
    }

    async fn read_socket_into_inbound(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        self.inbound.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn read_socket_into_socket_in(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        self.socket_in.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn write_framed(&mut self, frame: &[u8]) -> Result<()> {
        match self.mode {
            FramingMode::Raw => self.write_raw(frame).await,
            FramingMode::WebSocket => {
                let wrapped = ws::encode_binary(frame);
                self.write_raw(&wrapped).await
            }
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for FramedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("mode", &self.mode)
            .field("attached", &self.stream.is_some())
            .field("inbound_len", &self.inbound.len())
            .field("next_send_seq", &self.next_send_seq)
            .finish()
    }
}
