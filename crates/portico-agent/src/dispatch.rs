//! Routes validated connection intents to registry actions.
//!
//! The dispatcher is the only writer of the registry. For each intent it
//! performs the new / resume / reject action for that connection flavor,
//! sends the acknowledgement or error reply, and moves transport
//! ownership to its final holder: the management actor, the
//! extension-host factory, or the tunnel bridge.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use portico_core::error::{Error, Result};
use portico_core::protocol::{ExtensionHostAck, ExtensionHostParams, ServerMessage};
use portico_core::FramedTransport;

use crate::connection::ManagementConnection;
use crate::exthost::{resolve_debug_port, ExtensionHostFactory};
use crate::handshake::ConnectionIntent;
use crate::registry::ConnectionRegistry;
use crate::tunnel;

/// Dispatch context shared by all connection tasks.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    factory: Arc<dyn ExtensionHostFactory>,
    reconnection_grace: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        factory: Arc<dyn ExtensionHostFactory>,
        reconnection_grace: Duration,
    ) -> Self {
        Self {
            registry,
            factory,
            reconnection_grace,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Route one intent. Dropping the transport (and with it the socket)
    /// is the close on every error path.
    pub async fn dispatch(&self, intent: ConnectionIntent, transport: FramedTransport) {
        let result = match intent {
            ConnectionIntent::Reject { reason } => {
                self.reject(transport, &reason).await;
                return;
            }
            ConnectionIntent::Management {
                token,
                is_reconnection: false,
            } => self.fresh_management(token, transport).await,
            ConnectionIntent::Management {
                token,
                is_reconnection: true,
            } => self.resume_management(token, transport).await,
            ConnectionIntent::ExtensionHost {
                token,
                is_reconnection: false,
                start_params,
            } => self.fresh_extension_host(token, start_params, transport).await,
            ConnectionIntent::ExtensionHost {
                token,
                is_reconnection: true,
                ..
            } => self.resume_extension_host(token, transport).await,
            ConnectionIntent::Tunnel { target_port } => {
                tunnel::bridge(transport, target_port).await
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "dispatch failed");
        }
    }

    async fn fresh_management(&self, token: String, mut transport: FramedTransport) -> Result<()> {
        let (conn, run) = ManagementConnection::new(
            token.clone(),
            self.reconnection_grace,
            self.registry.cleanup_handle(),
        );

        if let Err(e) = self.registry.insert_management(Arc::clone(&conn)) {
            self.reject_with(&mut transport, &e).await;
            return Err(e);
        }
        tokio::spawn(run);

        // The ok travels on the same transport the actor takes over, so
        // it sits in the replay window like any other control message. A
        // socket that dies right here just leaves the connection detached
        // awaiting resume, with the ok queued for replay.
        if let Err(e) = transport
            .send_control(&serde_json::to_vec(&ServerMessage::Ok)?)
            .await
        {
            warn!(token, error = %e, "socket lost before ack, awaiting resume");
            transport.detach();
        }

        conn.attach(transport)?;
        info!(token, "management connection established");
        Ok(())
    }

    async fn resume_management(&self, token: String, mut transport: FramedTransport) -> Result<()> {
        let conn = match self.registry.resume_management(&token) {
            Ok(conn) => conn,
            Err(e) => {
                self.reject_with(&mut transport, &e).await;
                return Err(e);
            }
        };

        transport
            .send_control(&serde_json::to_vec(&ServerMessage::Ok)?)
            .await?;

        let (stream, buffered) = transport.into_parts();
        let stream = stream.ok_or(Error::ConnectionClosed)?;
        conn.accept_reconnection(stream, buffered)?;
        info!(token, "management connection resumed");
        Ok(())
    }

    async fn fresh_extension_host(
        &self,
        token: String,
        start_params: ExtensionHostParams,
        mut transport: FramedTransport,
    ) -> Result<()> {
        let slot = match self.registry.begin_extension_host(&token) {
            Ok(slot) => slot,
            Err(e) => {
                self.reject_with(&mut transport, &e).await;
                return Err(e);
            }
        };

        let params = resolve_debug_port(start_params).await;
        let ack = ExtensionHostAck {
            debug_port: params.port,
        };
        transport.send_control(&serde_json::to_vec(&ack)?).await?;

        let (stream, buffered) = transport.into_parts();
        let stream = stream.ok_or(Error::ConnectionClosed)?;

        let spawned = self
            .factory
            .spawn(
                token.clone(),
                params,
                stream,
                buffered,
                self.reconnection_grace,
                self.registry.cleanup_handle(),
            )
            .await;

        match spawned {
            Ok((conn, run)) => {
                slot.commit(conn);
                tokio::spawn(run);
                info!(token, "extension host connection established");
                Ok(())
            }
            Err(e) => {
                // The reservation drops with `slot`; no entry was created.
                warn!(token, error = %e, "extension host spawn failed");
                Err(e)
            }
        }
    }

    async fn resume_extension_host(
        &self,
        token: String,
        mut transport: FramedTransport,
    ) -> Result<()> {
        let conn = match self.registry.resume_extension_host(&token) {
            Ok(conn) => conn,
            Err(e) => {
                self.reject_with(&mut transport, &e).await;
                return Err(e);
            }
        };

        let ack = ExtensionHostAck {
            debug_port: conn.debug_port(),
        };
        transport.send_control(&serde_json::to_vec(&ack)?).await?;

        let (stream, buffered) = transport.into_parts();
        let stream = stream.ok_or(Error::ConnectionClosed)?;
        conn.accept_reconnection(stream, buffered)?;
        info!(token, "extension host connection resumed");
        Ok(())
    }

    async fn reject(&self, mut transport: FramedTransport, reason: &str) {
        warn!(reason, "rejecting connection");
        let reply = ServerMessage::Error {
            reason: reason.to_string(),
        };
        if let Ok(payload) = serde_json::to_vec(&reply) {
            let _ = transport.send_control(&payload).await;
        }
        // Dropping the transport closes the socket.
    }

    async fn reject_with(&self, transport: &mut FramedTransport, error: &Error) {
        let reason = error
            .reject_reason()
            .unwrap_or("Unknown initial data received.");
        warn!(reason, "rejecting connection");
        let reply = ServerMessage::Error {
            reason: reason.to_string(),
        };
        if let Ok(payload) = serde_json::to_vec(&reply) {
            let _ = transport.send_control(&payload).await;
        }
    }
}
