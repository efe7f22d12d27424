//! HTTP listener and WebSocket upgrade path.
//!
//! One TCP listener carries the whole external surface: the two plain
//! endpoints (`/version`, `/delay-shutdown`), static workbench assets,
//! and the WebSocket upgrade that feeds the handshake machine. The
//! request head is parsed here; anything read beyond it is carried into
//! the transport so pipelined client bytes survive the upgrade.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use portico_core::constants::MAX_HTTP_HEAD;
use portico_core::error::{Error, Result};
use portico_core::transport::ws;
use portico_core::{FramedTransport, FramingMode};

use crate::assets;
use crate::dispatch::Dispatcher;
use crate::handshake::{self, AuthContext};
use crate::supervisor::SupervisorHandle;

/// Everything a connection task needs, fixed at startup.
pub struct AgentState {
    pub dispatcher: Dispatcher,
    pub auth: AuthContext,
    pub supervisor: SupervisorHandle,
    pub commit: Option<String>,
    pub web_root: Option<PathBuf>,
}

/// The agent's HTTP listener.
pub struct AgentListener {
    listener: TcpListener,
    state: Arc<AgentState>,
}

impl AgentListener {
    pub async fn bind(addr: SocketAddr, state: Arc<AgentState>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; never returns under normal operation.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Plain static endpoint for webview assets; no upgrade support.
pub struct WebviewListener {
    listener: TcpListener,
    web_root: Option<PathBuf>,
}

impl WebviewListener {
    pub async fn bind(addr: SocketAddr, web_root: Option<PathBuf>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, web_root })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (mut stream, _) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "webview accept failed");
                    continue;
                }
            };
            let web_root = self.web_root.clone();
            tokio::spawn(async move {
                let Ok((head, _leftover)) = read_request_head(&mut stream).await else {
                    let _ = write_response(&mut stream, 400, "text/plain", b"Bad request").await;
                    return;
                };
                if head.method != "GET" {
                    let body = format!("Unsupported method {}", head.method);
                    let _ = write_response(&mut stream, 500, "text/plain", body.as_bytes()).await;
                    return;
                }
                let res = assets::serve(web_root.as_deref(), &head.path).await;
                let _ = write_response(&mut stream, res.status, res.content_type, &res.body).await;
            });
        }
    }
}

// =============================================================================
// Request head parsing
// =============================================================================

/// Parsed HTTP request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Header names lowercased.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether this request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

/// Read the request head off the socket. Returns the parsed head plus
/// any bytes that arrived beyond the terminating CRLF CRLF.
async fn read_request_head(stream: &mut TcpStream) -> Result<(RequestHead, Bytes)> {
    let mut buf = BytesMut::with_capacity(1024);
    let end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HTTP_HEAD {
            return Err(Error::Http {
                message: "request head too large".into(),
            });
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Http {
                message: "connection closed before request head".into(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head_bytes = buf.split_to(end + 4);
    let leftover = buf.freeze();
    let head = parse_request_head(&head_bytes)?;
    Ok((head, leftover))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| Error::Http {
        message: "request head is not valid UTF-8".into(),
    })?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Http {
            message: format!("malformed request line: {request_line:?}"),
        });
    };
    if !version.starts_with("HTTP/") {
        return Err(Error::Http {
            message: format!("unsupported protocol: {version}"),
        });
    }

    let (path, query_raw) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        query: parse_query(query_raw),
        headers,
    })
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (percent_decode(name), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(std::str::from_utf8(h).ok()?, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// =============================================================================
// Responses
// =============================================================================

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        content_type,
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn write_upgrade_response(stream: &mut TcpStream, accept: &str) -> Result<()> {
    let head = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n",
    );
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

// =============================================================================
// Connection handling
// =============================================================================

async fn handle_connection(mut stream: TcpStream, state: Arc<AgentState>) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let (head, leftover) = match read_request_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "bad request head");
            let _ = write_response(&mut stream, 400, "text/plain", b"Bad request").await;
            return Err(e);
        }
    };

    if head.method != "GET" {
        let body = format!("Unsupported method {}", head.method);
        write_response(&mut stream, 500, "text/plain", body.as_bytes()).await?;
        return Ok(());
    }

    if head.is_websocket_upgrade() {
        return handle_upgrade(stream, head, leftover, state).await;
    }

    match head.path.as_str() {
        "/version" => {
            let body = state.commit.clone().unwrap_or_default();
            write_response(&mut stream, 200, "text/html", body.as_bytes()).await
        }
        "/delay-shutdown" => {
            state.supervisor.delay_shutdown();
            write_response(&mut stream, 200, "text/plain", b"OK").await
        }
        path => {
            let res = assets::serve(state.web_root.as_deref(), path).await;
            write_response(&mut stream, res.status, res.content_type, &res.body).await
        }
    }
}

async fn handle_upgrade(
    mut stream: TcpStream,
    head: RequestHead,
    leftover: Bytes,
    state: Arc<AgentState>,
) -> Result<()> {
    let Some(key) = head.header("sec-websocket-key") else {
        warn!("upgrade request without Sec-WebSocket-Key");
        write_response(&mut stream, 400, "text/plain", b"Bad request").await?;
        return Err(Error::Http {
            message: "missing Sec-WebSocket-Key".into(),
        });
    };

    let accept = ws::accept_key(key);
    write_upgrade_response(&mut stream, &accept).await?;

    // Empty reconnectionToken counts as absent; the server mints one.
    let token = match head.query_param("reconnectionToken") {
        Some(token) if !token.is_empty() => token.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    let is_reconnection = head.query_param("reconnection") == Some("true");
    let mode = if head.query_param("skipWebSocketFrames") == Some("true") {
        FramingMode::Raw
    } else {
        FramingMode::WebSocket
    };

    info!(token, is_reconnection, ?mode, "socket upgraded");

    let mut transport = FramedTransport::new(Box::new(stream), mode, leftover);
    let intent = handshake::drive(&mut transport, &state.auth, &token, is_reconnection).await?;
    state.dispatcher.dispatch(intent, transport).await;
    Ok(())
}
