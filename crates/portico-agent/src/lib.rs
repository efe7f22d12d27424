//! portico-agent: server-side agent of the portico remote development
//! platform.
//!
//! Provides:
//! - CLI argument parsing
//! - The HTTP listener with WebSocket upgrade and the plain endpoints
//! - The handshake state machine and connection-type dispatch
//! - The reconnection registry and connection actors
//! - Extension-host worker spawning with debug-port resolution
//! - Byte-transparent TCP tunnels
//! - The idle-shutdown supervisor
//! - A minimal static asset handler for the workbench and webview

pub mod assets;
pub mod cli;
pub mod connection;
pub mod dispatch;
pub mod exthost;
pub mod handshake;
pub mod listener;
pub mod registry;
pub mod supervisor;
pub mod tunnel;

pub use cli::Cli;
pub use connection::ManagementConnection;
pub use dispatch::Dispatcher;
pub use exthost::{ExtensionHostConnection, ExtensionHostFactory, ProcessExtensionHostFactory};
pub use handshake::{AuthContext, ConnectionIntent};
pub use listener::{AgentListener, AgentState, WebviewListener};
pub use registry::{ConnectionRegistry, RegistryCommand, RegistryEvent};
pub use supervisor::SupervisorHandle;
