//! portico-core: shared protocol, transport, and plumbing for the
//! portico remote development agent.
//!
//! This crate provides:
//! - Handshake/control message definitions and the wire frame codec
//! - The resumable framed transport with its WebSocket layer
//! - The pluggable signer seam for handshake validation
//! - Error types, constants, and logging setup

pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod signer;
pub mod transport;

pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
pub use signer::Signer;
pub use transport::{BoxedStream, FramedTransport, FramingMode, WireStream};
