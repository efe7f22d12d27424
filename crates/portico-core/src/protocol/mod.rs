//! Control-plane protocol: message shapes and wire framing.
//!
//! Handshake and acknowledgement messages are JSON objects (see
//! [`messages`]); on the wire each one travels inside a length-prefixed,
//! sequence-numbered frame (see [`codec`]). After dispatch, the same
//! framing carries whatever the connection's owner speaks.

pub mod codec;
pub mod messages;

#[cfg(test)]
mod proptest;

pub use codec::{Frame, FrameCodec, FRAME_HEADER_LEN};
pub use messages::{
    AuthRequest, ConnectionTypeRequest, DesiredConnectionType, ExtensionHostAck,
    ExtensionHostParams, HandshakeMessage, ServerMessage, TunnelParams,
};
