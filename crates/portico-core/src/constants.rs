//! Protocol and configuration constants for portico.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Magic GUID appended to the client key when computing the WebSocket
/// accept token (RFC 6455 §4).
pub const WEBSOCKET_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum control message payload size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Sign-challenge payload sent when no signer capability is available.
pub const SIGN_PLACEHOLDER: &str = "unsigned";

/// Length of a generated connection token.
pub const CONNECTION_TOKEN_LEN: usize = 24;

// =============================================================================
// Timing Constants
// =============================================================================

/// Grace period after the last extension host closes before the agent
/// shuts itself down.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long a detached connection waits for a resume before it is closed.
pub const RECONNECTION_GRACE: Duration = Duration::from_secs(3 * 60 * 60);

/// Total budget for probing free debug ports.
pub const DEBUG_PORT_PROBE_BUDGET: Duration = Duration::from_secs(5);

/// Maximum number of candidate debug ports to probe.
pub const DEBUG_PORT_PROBE_ATTEMPTS: u16 = 10;

// =============================================================================
// Buffer Limits
// =============================================================================

/// Upper bound on retained outbound frames for replay after a rebind.
/// Oldest frames are dropped first once the window is full.
pub const REPLAY_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

/// Maximum accepted HTTP request head size.
pub const MAX_HTTP_HEAD: usize = 8 * 1024;

/// Read buffer size for byte pumps (tunnels, worker stdio).
pub const PUMP_BUFFER_SIZE: usize = 64 * 1024;

// =============================================================================
// Defaults
// =============================================================================

/// Default agent listen port.
pub const DEFAULT_PORT: u16 = 8000;
