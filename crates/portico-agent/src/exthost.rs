//! Extension-host connections: worker spawning and the socket pump.
//!
//! The dispatcher treats worker creation as a factory. The default
//! factory launches the configured worker executable and pairs it with
//! an [`ExtensionHostConnection`], whose actor pumps bytes between the
//! remote socket and the worker's stdio. The socket side is replaceable:
//! a resume swaps in a fresh stream, seeded with the buffered prefix
//! from the handshake. Worker exit is the terminal close; socket loss
//! only detaches.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use portico_core::constants::{
    DEBUG_PORT_PROBE_ATTEMPTS, DEBUG_PORT_PROBE_BUDGET, PUMP_BUFFER_SIZE,
};
use portico_core::error::{Error, Result};
use portico_core::protocol::ExtensionHostParams;
use portico_core::BoxedStream;

use crate::registry::RegistryCommand;

// =============================================================================
// Debug port resolution
// =============================================================================

/// Apply the debug-port policy to start parameters.
///
/// A requested port is replaced by the first free loopback port at or
/// after it (bounded probe); no free port leaves the request untouched.
/// Without a requested port, debugging is disabled entirely.
pub async fn resolve_debug_port(mut params: ExtensionHostParams) -> ExtensionHostParams {
    match params.port {
        Some(start) => {
            if let Some(free) = find_free_port(start).await {
                if free != start {
                    info!(requested = start, using = free, "debug port busy, moved");
                }
                params.port = Some(free);
            } else {
                warn!(requested = start, "no free debug port found");
            }
        }
        None => {
            params.debug_id = None;
            params.port = None;
            params.break_on_start = false;
        }
    }
    params
}

/// Probe loopback ports by bind-and-release. Bind failures count as
/// occupied, never as errors.
async fn find_free_port(start: u16) -> Option<u16> {
    let deadline = Instant::now() + DEBUG_PORT_PROBE_BUDGET;

    for offset in 0..DEBUG_PORT_PROBE_ATTEMPTS {
        let port = start.checked_add(offset)?;
        if Instant::now() >= deadline {
            return None;
        }

        match tokio::time::timeout_at(deadline, TcpListener::bind(("127.0.0.1", port))).await {
            Ok(Ok(listener)) => {
                drop(listener);
                return Some(port);
            }
            Ok(Err(_)) => continue,
            Err(_) => return None,
        }
    }
    None
}

// =============================================================================
// Connection actor
// =============================================================================

enum PumpCommand {
    Reconnect { stream: BoxedStream, buffered: Bytes },
    Close,
}

/// Handle to a live extension-host connection.
pub struct ExtensionHostConnection {
    token: String,
    debug_port: Option<u16>,
    params: ExtensionHostParams,
    cmd_tx: mpsc::UnboundedSender<PumpCommand>,
    close_tx: broadcast::Sender<()>,
}

impl ExtensionHostConnection {
    /// Pair a spawned worker with a remote stream. Returns the handle and
    /// the actor future; the caller spawns the future after registration.
    pub fn new(
        token: String,
        params: ExtensionHostParams,
        mut worker: Child,
        stream: BoxedStream,
        initial: Bytes,
        grace: Duration,
        cleanup_tx: mpsc::UnboundedSender<RegistryCommand>,
    ) -> Result<(Arc<Self>, BoxFuture<'static, ()>)> {
        let stdin = worker.stdin.take().ok_or_else(|| Error::Spawn {
            message: "worker spawned without piped stdin".into(),
        })?;
        let stdout = worker.stdout.take().ok_or_else(|| Error::Spawn {
            message: "worker spawned without piped stdout".into(),
        })?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (close_tx, _) = broadcast::channel(4);

        let conn = Arc::new(Self {
            token: token.clone(),
            debug_port: params.port,
            params,
            cmd_tx,
            close_tx: close_tx.clone(),
        });

        let run = run_pump(PumpState {
            token,
            worker,
            stdin,
            stdout,
            stream,
            initial,
            grace,
            cmd_rx,
            close_tx,
            cleanup_tx,
        })
        .boxed();

        Ok((conn, run))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Debug port resolved at spawn time, if debugging was requested.
    pub fn debug_port(&self) -> Option<u16> {
        self.debug_port
    }

    pub fn start_params(&self) -> &ExtensionHostParams {
        &self.params
    }

    /// Accept a resumed socket plus the handshake's buffered prefix.
    pub fn accept_reconnection(&self, stream: BoxedStream, buffered: Bytes) -> Result<()> {
        self.cmd_tx
            .send(PumpCommand::Reconnect { stream, buffered })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Terminally close: kills the worker and removes the registry entry.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(PumpCommand::Close);
    }

    /// Subscribe to the terminal close signal.
    pub fn on_close(&self) -> broadcast::Receiver<()> {
        self.close_tx.subscribe()
    }
}

impl std::fmt::Debug for ExtensionHostConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHostConnection")
            .field("token", &self.token)
            .field("debug_port", &self.debug_port)
            .finish()
    }
}

struct PumpState {
    token: String,
    worker: Child,
    stdin: tokio::process::ChildStdin,
    stdout: tokio::process::ChildStdout,
    stream: BoxedStream,
    initial: Bytes,
    grace: Duration,
    cmd_rx: mpsc::UnboundedReceiver<PumpCommand>,
    close_tx: broadcast::Sender<()>,
    cleanup_tx: mpsc::UnboundedSender<RegistryCommand>,
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_half(half: &mut Option<ReadHalf<BoxedStream>>, buf: &mut [u8]) -> std::io::Result<usize> {
    match half.as_mut() {
        Some(rd) => rd.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn run_pump(mut state: PumpState) {
    let token = state.token.clone();

    if !state.initial.is_empty() {
        if let Err(e) = state.stdin.write_all(&state.initial).await {
            warn!(token, error = %e, "failed to seed worker with buffered prefix");
        }
    }

    let (rd, wr) = tokio::io::split(state.stream);
    let mut rd: Option<ReadHalf<BoxedStream>> = Some(rd);
    let mut wr: Option<WriteHalf<BoxedStream>> = Some(wr);
    let mut deadline: Option<Instant> = None;
    let mut stdout_open = true;

    let mut sock_buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut child_buf = vec![0u8; PUMP_BUFFER_SIZE];

    loop {
        tokio::select! {
            cmd = state.cmd_rx.recv() => match cmd {
                Some(PumpCommand::Reconnect { stream, buffered }) => {
                    if !buffered.is_empty() {
                        if state.stdin.write_all(&buffered).await.is_err() {
                            break;
                        }
                    }
                    let (new_rd, new_wr) = tokio::io::split(stream);
                    rd = Some(new_rd);
                    wr = Some(new_wr);
                    deadline = None;
                    info!(token, "extension host socket resumed");
                }
                Some(PumpCommand::Close) | None => {
                    debug!(token, "extension host close requested");
                    break;
                }
            },
            status = state.worker.wait() => {
                match status {
                    Ok(status) => info!(token, %status, "extension host worker exited"),
                    Err(e) => warn!(token, error = %e, "waiting on worker failed"),
                }
                break;
            },
            res = read_half(&mut rd, &mut sock_buf) => match res {
                Ok(0) | Err(_) => {
                    info!(token, "socket lost, awaiting resume");
                    rd = None;
                    wr = None;
                    deadline = Some(Instant::now() + state.grace);
                }
                Ok(n) => {
                    if state.stdin.write_all(&sock_buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            // While detached, leave worker output in the pipe; the OS
            // buffer applies backpressure and nothing is lost.
            res = state.stdout.read(&mut child_buf), if stdout_open && wr.is_some() => match res {
                Ok(0) | Err(_) => {
                    stdout_open = false;
                }
                Ok(n) => {
                    let dead = match wr.as_mut() {
                        Some(w) => w.write_all(&child_buf[..n]).await.is_err(),
                        None => false,
                    };
                    if dead {
                        info!(token, "socket write failed, awaiting resume");
                        rd = None;
                        wr = None;
                        deadline = Some(Instant::now() + state.grace);
                    }
                }
            },
            _ = wait_deadline(deadline) => {
                info!(token, "reconnection grace expired");
                break;
            }
        }
    }

    if let Err(e) = state.worker.start_kill() {
        debug!(token, error = %e, "worker already gone");
    }
    let _ = state.cleanup_tx.send(RegistryCommand::RemoveExtensionHost(token.clone()));
    let _ = state.close_tx.send(());
    debug!(token, "extension host connection closed");
}

// =============================================================================
// Factory
// =============================================================================

/// Creates extension-host connections for the dispatcher.
#[async_trait]
pub trait ExtensionHostFactory: Send + Sync {
    /// Spawn a worker for `params` and wire it to `stream`, delivering
    /// `initial` to the worker before any socket bytes.
    async fn spawn(
        &self,
        token: String,
        params: ExtensionHostParams,
        stream: BoxedStream,
        initial: Bytes,
        grace: Duration,
        cleanup_tx: mpsc::UnboundedSender<RegistryCommand>,
    ) -> Result<(Arc<ExtensionHostConnection>, BoxFuture<'static, ()>)>;
}

/// Default factory: launches the configured worker executable.
pub struct ProcessExtensionHostFactory {
    worker_cmd: Option<PathBuf>,
    worker_args: Vec<String>,
}

impl ProcessExtensionHostFactory {
    pub fn new(worker_cmd: Option<PathBuf>, worker_args: Vec<String>) -> Self {
        Self {
            worker_cmd,
            worker_args,
        }
    }
}

#[async_trait]
impl ExtensionHostFactory for ProcessExtensionHostFactory {
    async fn spawn(
        &self,
        token: String,
        params: ExtensionHostParams,
        stream: BoxedStream,
        initial: Bytes,
        grace: Duration,
        cleanup_tx: mpsc::UnboundedSender<RegistryCommand>,
    ) -> Result<(Arc<ExtensionHostConnection>, BoxFuture<'static, ()>)> {
        let worker_cmd = self.worker_cmd.as_ref().ok_or_else(|| Error::Spawn {
            message: "no extension host worker configured".into(),
        })?;

        let mut cmd = Command::new(worker_cmd);
        cmd.args(&self.worker_args);
        if let Some(language) = &params.language {
            cmd.arg("--language").arg(language);
        }
        if let Some(port) = params.port {
            cmd.arg("--debug-port").arg(port.to_string());
            if params.break_on_start {
                cmd.arg("--debug-break");
            }
            if let Some(debug_id) = &params.debug_id {
                cmd.arg("--debug-id").arg(debug_id);
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let worker = cmd.spawn().map_err(|e| Error::Spawn {
            message: format!("{}: {e}", worker_cmd.display()),
        })?;
        info!(token, worker = %worker_cmd.display(), debug_port = ?params.port, "spawned extension host worker");

        ExtensionHostConnection::new(token, params, worker, stream, initial, grace, cleanup_tx)
    }
}
