//! Error types for portico-core.

use thiserror::Error;

/// Main error type for portico operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or malformed message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Client failed authentication or signature validation.
    #[error("unauthorized client")]
    Unauthorized,

    /// Client and server were built from different commits.
    #[error("client/server version mismatch")]
    VersionMismatch,

    /// Fresh connect with a reconnection token already in use.
    #[error("duplicate reconnection token: {0}")]
    DuplicateToken(String),

    /// Resume attempt with a token the registry does not know.
    #[error("unknown reconnection token: {0}")]
    UnknownToken(String),

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Malformed HTTP request or upgrade.
    #[error("http error: {message}")]
    Http { message: String },

    /// Worker process could not be spawned.
    #[error("spawn error: {message}")]
    Spawn { message: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec {
            message: e.to_string(),
        }
    }
}

impl Error {
    /// Returns true if this error is transient: the peer's session may still
    /// be resumable and the connection entry should be kept for reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed | Error::Timeout)
    }

    /// The client-facing reject reason for errors that end a handshake.
    ///
    /// These strings are part of the wire contract; clients match on them.
    pub fn reject_reason(&self) -> Option<&'static str> {
        match self {
            Error::Unauthorized => Some("Unauthorized client refused."),
            Error::VersionMismatch => Some("Version mismatch, client refused."),
            Error::DuplicateToken(_) => Some("Duplicate reconnection token."),
            Error::UnknownToken(_) => Some("Unknown reconnection token."),
            Error::Protocol { .. } | Error::Codec { .. } => {
                Some("Unknown initial data received.")
            }
            _ => None,
        }
    }
}

/// Convenience result type for portico operations.
pub type Result<T> = std::result::Result<T, Error>;
