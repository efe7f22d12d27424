//! Management connection actor.
//!
//! A [`ManagementConnection`] owns one [`FramedTransport`] for the
//! lifetime of a logical control channel, across any number of physical
//! sockets. The actor task serializes everything that touches the
//! transport: inbound control messages fan out to subscribers, a dead
//! socket flips the connection to the detached state, and a resume swaps
//! a fresh socket in together with the buffered prefix read by the
//! ephemeral handshake transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use portico_core::error::{Error, Result};
use portico_core::{BoxedStream, FramedTransport};

use crate::registry::RegistryCommand;

/// Commands accepted by the connection actor.
enum Command {
    /// Initial transport, handed over once right after registration.
    Attach(FramedTransport),
    /// Resume with a replacement socket and the handshake's buffered prefix.
    Reconnect { stream: BoxedStream, buffered: Bytes },
    /// Queue a control message for the client.
    Send(Bytes),
    /// Terminal close.
    Close,
}

/// Handle to a live management connection.
pub struct ManagementConnection {
    token: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    messages_tx: broadcast::Sender<Bytes>,
    close_tx: broadcast::Sender<()>,
}

impl ManagementConnection {
    /// Create the connection and its (not yet spawned) actor future.
    ///
    /// The connection starts without a transport; the dispatcher attaches
    /// one with [`attach`](Self::attach) after registration succeeds, so
    /// registration failure never costs a constructed transport.
    pub fn new(
        token: String,
        grace: Duration,
        cleanup_tx: mpsc::UnboundedSender<RegistryCommand>,
    ) -> (Arc<Self>, impl std::future::Future<Output = ()> + Send) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (messages_tx, _) = broadcast::channel(256);
        let (close_tx, _) = broadcast::channel(4);

        let conn = Arc::new(Self {
            token: token.clone(),
            cmd_tx,
            messages_tx: messages_tx.clone(),
            close_tx: close_tx.clone(),
        });

        let run = run_actor(token, grace, cmd_rx, messages_tx, close_tx, cleanup_tx);
        (conn, run)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Hand the initial transport to the actor.
    pub fn attach(&self, transport: FramedTransport) -> Result<()> {
        self.command(Command::Attach(transport))
    }

    /// Accept a resumed socket plus the buffered prefix drained from the
    /// ephemeral handshake transport.
    pub fn accept_reconnection(&self, stream: BoxedStream, buffered: Bytes) -> Result<()> {
        self.command(Command::Reconnect { stream, buffered })
    }

    /// Queue a control message. While detached it is retained and
    /// replayed on resume.
    pub fn send(&self, payload: Bytes) -> Result<()> {
        self.command(Command::Send(payload))
    }

    /// Terminally close the connection; the registry entry goes away.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Subscribe to decoded inbound control messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.messages_tx.subscribe()
    }

    /// Subscribe to the terminal close signal.
    pub fn on_close(&self) -> broadcast::Receiver<()> {
        self.close_tx.subscribe()
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::ConnectionClosed)
    }
}

impl std::fmt::Debug for ManagementConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementConnection")
            .field("token", &self.token)
            .finish()
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_actor(
    token: String,
    grace: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    messages_tx: broadcast::Sender<Bytes>,
    close_tx: broadcast::Sender<()>,
    cleanup_tx: mpsc::UnboundedSender<RegistryCommand>,
) {
    let mut transport: Option<FramedTransport> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let attached = transport.as_ref().map(|t| t.is_attached()).unwrap_or(false);

        if attached {
            let Some(t) = transport.as_mut() else { break };
            let mut replacement: Option<FramedTransport> = None;

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Attach(new_transport)) => {
                        replacement = Some(new_transport);
                    }
                    Some(Command::Reconnect { stream, buffered }) => {
                        t.feed_inbound(buffered);
                        if let Err(e) = t.rebind(stream, 0).await {
                            warn!(token, error = %e, "rebind on live connection failed");
                            t.detach();
                            deadline = Some(Instant::now() + grace);
                        }
                    }
                    Some(Command::Send(payload)) => {
                        if let Err(e) = t.send_control(&payload).await {
                            debug!(token, error = %e, "send failed, detaching");
                            t.detach();
                            deadline = Some(Instant::now() + grace);
                        }
                    }
                    Some(Command::Close) | None => break,
                },
                res = t.recv_control() => match res {
                    Ok(payload) => {
                        let _ = messages_tx.send(payload);
                    }
                    Err(e) if e.is_transient() => {
                        info!(token, "socket lost, awaiting resume");
                        t.detach();
                        deadline = Some(Instant::now() + grace);
                    }
                    Err(e) => {
                        warn!(token, error = %e, "management protocol error");
                        break;
                    }
                },
            }

            if let Some(new_transport) = replacement {
                deadline = if new_transport.is_attached() {
                    None
                } else {
                    Some(Instant::now() + grace)
                };
                transport = Some(new_transport);
            }
        } else {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Attach(new_transport)) => {
                        deadline = if new_transport.is_attached() {
                            None
                        } else {
                            Some(Instant::now() + grace)
                        };
                        transport = Some(new_transport);
                    }
                    Some(Command::Reconnect { stream, buffered }) => {
                        if let Some(t) = transport.as_mut() {
                            t.feed_inbound(buffered);
                            match t.rebind(stream, 0).await {
                                Ok(()) => {
                                    info!(token, "connection resumed");
                                    deadline = None;
                                }
                                Err(e) => {
                                    warn!(token, error = %e, "resume rebind failed");
                                    t.detach();
                                    deadline = Some(Instant::now() + grace);
                                }
                            }
                        }
                    }
                    Some(Command::Send(payload)) => {
                        if let Some(t) = transport.as_mut() {
                            // Buffers into the replay window.
                            let _ = t.send_control(&payload).await;
                        }
                    }
                    Some(Command::Close) | None => break,
                },
                _ = wait_deadline(deadline) => {
                    info!(token, "reconnection grace expired");
                    break;
                }
            }
        }
    }

    let _ = cleanup_tx.send(RegistryCommand::RemoveManagement(token.clone()));
    let _ = close_tx.send(());
    debug!(token, "management connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_core::protocol::FrameCodec;
    use portico_core::FramingMode;
    use tokio::io::{duplex, AsyncWriteExt};

    fn transport_pair() -> (FramedTransport, FramedTransport) {
        let (a, b) = duplex(64 * 1024);
        (
            FramedTransport::new(Box::new(a), FramingMode::Raw, Bytes::new()),
            FramedTransport::new(Box::new(b), FramingMode::Raw, Bytes::new()),
        )
    }

    #[tokio::test]
    async fn inbound_messages_fan_out_to_subscribers() {
        let (cleanup_tx, _cleanup_rx) = mpsc::unbounded_channel();
        let (conn, run) =
            ManagementConnection::new("tok".into(), Duration::from_secs(60), cleanup_tx);
        let mut messages = conn.subscribe();

        let (server_side, mut client) = transport_pair();
        conn.attach(server_side).unwrap();
        tokio::spawn(run);

        client.send_control(b"{\"op\":\"list\"}").await.unwrap();
        let got = messages.recv().await.unwrap();
        assert_eq!(&got[..], b"{\"op\":\"list\"}");
    }

    #[tokio::test]
    async fn socket_loss_keeps_connection_until_resume() {
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel();
        let (conn, run) =
            ManagementConnection::new("tok".into(), Duration::from_secs(60), cleanup_tx);
        let mut messages = conn.subscribe();

        let (server_side, client) = transport_pair();
        conn.attach(server_side).unwrap();
        tokio::spawn(run);

        // Kill the socket; the entry must NOT be removed.
        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cleanup_rx.try_recv().is_err());

        // Resume over a new socket; subsequent messages flow.
        let (new_sock, peer) = duplex(64 * 1024);
        conn.accept_reconnection(Box::new(new_sock), Bytes::new())
            .unwrap();
        let mut client = FramedTransport::new(Box::new(peer), FramingMode::Raw, Bytes::new());
        client.send_control(b"after-resume").await.unwrap();
        let got = messages.recv().await.unwrap();
        assert_eq!(&got[..], b"after-resume");
    }

    #[tokio::test]
    async fn buffered_prefix_is_delivered_before_new_socket_bytes() {
        let (cleanup_tx, _cleanup_rx) = mpsc::unbounded_channel();
        let (conn, run) =
            ManagementConnection::new("tok".into(), Duration::from_secs(60), cleanup_tx);
        let mut messages = conn.subscribe();

        let (server_side, client) = transport_pair();
        conn.attach(server_side).unwrap();
        tokio::spawn(run);
        drop(client);

        // Prefix: a full frame the ephemeral transport had already read.
        let prefix = FrameCodec::encode(0, b"from-prefix").unwrap();
        let (new_sock, peer) = duplex(64 * 1024);
        conn.accept_reconnection(Box::new(new_sock), prefix).unwrap();

        let mut raw_peer = peer;
        raw_peer
            .write_all(&FrameCodec::encode(1, b"from-socket").unwrap())
            .await
            .unwrap();

        assert_eq!(&messages.recv().await.unwrap()[..], b"from-prefix");
        assert_eq!(&messages.recv().await.unwrap()[..], b"from-socket");
    }

    #[tokio::test]
    async fn grace_expiry_removes_entry_and_fires_close() {
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel();
        let (conn, run) =
            ManagementConnection::new("tok".into(), Duration::from_millis(50), cleanup_tx);
        let mut closed = conn.on_close();

        let (server_side, client) = transport_pair();
        conn.attach(server_side).unwrap();
        tokio::spawn(run);
        drop(client);

        let cmd = cleanup_rx.recv().await.unwrap();
        assert_eq!(cmd, RegistryCommand::RemoveManagement("tok".into()));
        closed.recv().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_close_is_terminal() {
        let (cleanup_tx, mut cleanup_rx) = mpsc::unbounded_channel();
        let (conn, run) =
            ManagementConnection::new("tok".into(), Duration::from_secs(60), cleanup_tx);
        let (server_side, _client) = transport_pair();
        conn.attach(server_side).unwrap();
        tokio::spawn(run);

        conn.close();
        let cmd = cleanup_rx.recv().await.unwrap();
        assert_eq!(cmd, RegistryCommand::RemoveManagement("tok".into()));
    }

    #[tokio::test]
    async fn messages_sent_while_detached_replay_on_resume() {
        let (cleanup_tx, _cleanup_rx) = mpsc::unbounded_channel();
        let (conn, run) =
            ManagementConnection::new("tok".into(), Duration::from_secs(60), cleanup_tx);
        let (server_side, client) = transport_pair();
        conn.attach(server_side).unwrap();
        tokio::spawn(run);

        drop(client);
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.send(Bytes::from_static(b"queued-while-down")).unwrap();

        let (new_sock, peer) = duplex(64 * 1024);
        conn.accept_reconnection(Box::new(new_sock), Bytes::new())
            .unwrap();
        let mut client = FramedTransport::new(Box::new(peer), FramingMode::Raw, Bytes::new());
        assert_eq!(
            &client.recv_control().await.unwrap()[..],
            b"queued-while-down"
        );
    }
}
