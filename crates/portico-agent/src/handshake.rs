//! Handshake state machine for upgraded sockets.
//!
//! Two states, driven by peer control messages: `AwaitAuth` accepts the
//! shared-secret nonce and answers with a sign challenge; `AwaitType`
//! validates the signed challenge and the requested connection plane.
//! The machine owns the transport only while driving; the terminal
//! transition hands both transport and intent back to the caller, so no
//! stale subscription can observe post-handshake traffic.

use std::sync::Arc;

use tracing::{debug, warn};

use portico_core::error::Result;
use portico_core::protocol::{
    ConnectionTypeRequest, DesiredConnectionType, ExtensionHostParams, HandshakeMessage,
    ServerMessage, TunnelParams,
};
use portico_core::signer::{challenge_for, Signer};
use portico_core::FramedTransport;

/// Server-side handshake inputs, fixed at startup.
pub struct AuthContext {
    /// Startup secret every legitimate client knows.
    pub connection_token: String,
    /// Build commit; `None` for unbuilt dev servers.
    pub commit: Option<String>,
    /// Optional challenge signer capability.
    pub signer: Option<Arc<dyn Signer>>,
}

impl AuthContext {
    pub fn new(connection_token: String, commit: Option<String>) -> Self {
        Self {
            connection_token,
            commit,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }
}

/// What an upgraded, authenticated socket wants to become.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionIntent {
    Management {
        token: String,
        is_reconnection: bool,
    },
    ExtensionHost {
        token: String,
        is_reconnection: bool,
        start_params: ExtensionHostParams,
    },
    Tunnel {
        target_port: u16,
    },
    Reject {
        reason: String,
    },
}

const REASON_UNAUTHORIZED: &str = "Unauthorized client refused.";
const REASON_VERSION: &str = "Version mismatch, client refused.";
const REASON_UNKNOWN_DATA: &str = "Unknown initial data received.";

enum State {
    AwaitAuth,
    AwaitType,
}

/// Drive the handshake to a terminal intent.
///
/// `token` and `is_reconnection` come from the upgrade query. Socket
/// errors bubble up as `Err`; protocol-level rejection is a regular
/// [`ConnectionIntent::Reject`] the dispatcher answers and closes.
pub async fn drive(
    transport: &mut FramedTransport,
    ctx: &AuthContext,
    token: &str,
    is_reconnection: bool,
) -> Result<ConnectionIntent> {
    let mut state = State::AwaitAuth;

    loop {
        let payload = transport.recv_control().await?;
        let message: HandshakeMessage = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed handshake message");
                let reason = match state {
                    State::AwaitAuth => REASON_UNAUTHORIZED,
                    State::AwaitType => REASON_UNKNOWN_DATA,
                };
                return Ok(ConnectionIntent::Reject {
                    reason: reason.into(),
                });
            }
        };

        match (&state, message) {
            (State::AwaitAuth, HandshakeMessage::Auth(auth)) => {
                if auth.auth != ctx.connection_token {
                    warn!("auth nonce mismatch");
                    return Ok(ConnectionIntent::Reject {
                        reason: REASON_UNAUTHORIZED.into(),
                    });
                }

                let challenge = ServerMessage::Sign {
                    data: challenge_for(ctx.signer.as_deref(), &ctx.connection_token),
                };
                transport.send_control(&serde_json::to_vec(&challenge)?).await?;
                state = State::AwaitType;
            }
            (State::AwaitType, HandshakeMessage::ConnectionType(request)) => {
                return Ok(finish(ctx, token, is_reconnection, request));
            }
            (State::AwaitAuth, other) => {
                warn!(message = ?other, "expected auth message");
                return Ok(ConnectionIntent::Reject {
                    reason: REASON_UNAUTHORIZED.into(),
                });
            }
            (State::AwaitType, other) => {
                warn!(message = ?other, "expected connectionType message");
                return Ok(ConnectionIntent::Reject {
                    reason: REASON_UNKNOWN_DATA.into(),
                });
            }
        }
    }
}

/// Validate the `connectionType` request and produce the intent.
fn finish(
    ctx: &AuthContext,
    token: &str,
    is_reconnection: bool,
    request: ConnectionTypeRequest,
) -> ConnectionIntent {
    if let (Some(ours), Some(theirs)) = (&ctx.commit, &request.commit) {
        if ours != theirs {
            warn!(server = ours, client = theirs, "commit mismatch");
            return ConnectionIntent::Reject {
                reason: REASON_VERSION.into(),
            };
        }
    }

    let signed_ok = request.signed_data == ctx.connection_token
        || ctx
            .signer
            .as_deref()
            .map(|s| s.validate(&request.signed_data))
            .unwrap_or(false);

    if !signed_ok {
        if request.is_built {
            warn!("invalid signed data from built client");
            return ConnectionIntent::Reject {
                reason: REASON_UNAUTHORIZED.into(),
            };
        }
        // Development clients are let through so local loops work
        // without the signer toolchain.
        debug!("accepting dev client with unvalidated signature");
    }

    match request.desired_connection_type {
        DesiredConnectionType::Management => ConnectionIntent::Management {
            token: token.to_string(),
            is_reconnection,
        },
        DesiredConnectionType::ExtensionHost => {
            let start_params = request
                .args
                .and_then(|args| serde_json::from_value::<ExtensionHostParams>(args).ok())
                .unwrap_or_default();
            ConnectionIntent::ExtensionHost {
                token: token.to_string(),
                is_reconnection,
                start_params,
            }
        }
        DesiredConnectionType::Tunnel => {
            match request
                .args
                .and_then(|args| serde_json::from_value::<TunnelParams>(args).ok())
            {
                Some(TunnelParams { port }) => ConnectionIntent::Tunnel { target_port: port },
                None => {
                    warn!("tunnel request without a target port");
                    ConnectionIntent::Reject {
                        reason: REASON_UNKNOWN_DATA.into(),
                    }
                }
            }
        }
        DesiredConnectionType::Unknown => ConnectionIntent::Reject {
            reason: REASON_UNKNOWN_DATA.into(),
        },
    }
}
