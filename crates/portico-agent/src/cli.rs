//! Agent CLI implementation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use rand::distributions::Alphanumeric;
use rand::Rng;

use portico_core::constants::{CONNECTION_TOKEN_LEN, DEFAULT_PORT};
use portico_core::error::{Error, Result};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for portico_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => portico_core::LogFormat::Text,
            CliLogFormat::Json => portico_core::LogFormat::Json,
        }
    }
}

/// portico agent - connection plane for remote development clients.
#[derive(Debug, Parser)]
#[command(
    name = "portico-agent",
    version,
    about = "Hosts extension-host workers, the web UI, and per-port tunnels for remote clients"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(long = "host", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Port for the webview asset endpoint (default: port + 1)
    #[arg(long = "webview-port")]
    pub webview_port: Option<u16>,

    /// Connection token clients must present during the handshake
    #[arg(long = "connection-token", env = "PORTICO_CONNECTION_TOKEN")]
    pub connection_token: Option<String>,

    /// File containing the connection token (trailing whitespace trimmed)
    #[arg(long = "connection-token-file", value_name = "FILE")]
    pub connection_token_file: Option<PathBuf>,

    /// Build commit advertised on /version and checked against clients
    #[arg(long = "commit", env = "PORTICO_COMMIT")]
    pub commit: Option<String>,

    /// Directory with the built web UI assets
    #[arg(long = "web-root", value_name = "DIR")]
    pub web_root: Option<PathBuf>,

    /// Extension host worker executable
    #[arg(long = "worker-cmd", value_name = "PATH")]
    pub worker_cmd: Option<PathBuf>,

    /// Extra arguments passed to the worker executable
    #[arg(long = "worker-arg", action = ArgAction::Append, value_name = "ARG")]
    pub worker_args: Vec<String>,

    /// Shut the agent down after five idle minutes without extension hosts
    #[arg(long = "enable-remote-auto-shutdown")]
    pub enable_remote_auto_shutdown: bool,

    /// How long a detached connection may await a resume (seconds)
    #[arg(
        long = "reconnection-grace",
        default_value_t = portico_core::constants::RECONNECTION_GRACE.as_secs(),
        value_name = "SECONDS"
    )]
    pub reconnection_grace_secs: u64,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Socket address of the main listener.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Socket address of the webview endpoint. Binds loopback-equivalent
    /// to the main host, one port up unless overridden.
    pub fn webview_socket_addr(&self) -> SocketAddr {
        let port = self.webview_port.unwrap_or_else(|| self.port.wrapping_add(1));
        SocketAddr::new(self.host, port)
    }

    /// Resolve the connection token: file wins over the flag; without
    /// either, a fresh random token is generated. There is deliberately
    /// no fixed fallback secret.
    pub fn resolve_connection_token(&self) -> Result<String> {
        if let Some(path) = &self.connection_token_file {
            let raw = std::fs::read_to_string(path)?;
            let token = raw.trim().to_string();
            if token.is_empty() {
                return Err(Error::Protocol {
                    message: format!("connection token file {} is empty", path.display()),
                });
            }
            return Ok(token);
        }

        if let Some(token) = &self.connection_token {
            if token.is_empty() {
                return Err(Error::Protocol {
                    message: "connection token must not be empty".into(),
                });
            }
            return Ok(token.clone());
        }

        Ok(generate_connection_token())
    }
}

/// Generate a random alphanumeric connection token.
pub fn generate_connection_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CONNECTION_TOKEN_LEN)
        .map(char::from)
        .collect()
}
