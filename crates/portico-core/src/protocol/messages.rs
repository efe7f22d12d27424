//! JSON message shapes for the connection handshake.
//!
//! Client messages arrive as a tagged union on `type`; the two server
//! reply families (`sign`/`ok`/`error` and the extension-host ack) are
//! kept separate because the ack deliberately carries no `type` field.

use serde::{Deserialize, Serialize};

/// Client → server handshake envelope, discriminated on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    /// First message: the shared-secret nonce.
    #[serde(rename = "auth")]
    Auth(AuthRequest),
    /// Second message: signed challenge plus the desired connection type.
    #[serde(rename = "connectionType")]
    ConnectionType(ConnectionTypeRequest),
}

/// Payload of the `auth` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Nonce compared against the server's connection token.
    pub auth: String,
}

/// Payload of the `connectionType` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTypeRequest {
    /// Response to the server's sign challenge.
    pub signed_data: String,
    /// Build commit of the client, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Whether the client is a production build. Dev builds are allowed
    /// through with an invalid signature.
    #[serde(default)]
    pub is_built: bool,
    /// Which connection plane the client wants.
    pub desired_connection_type: DesiredConnectionType,
    /// Type-specific arguments; parsed per connection type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

/// The connection planes a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredConnectionType {
    /// Control channel for file/terminal/extension RPCs.
    Management,
    /// Channel attached to a spawned extension-host worker.
    ExtensionHost,
    /// Byte-transparent bridge to a local TCP port.
    Tunnel,
    /// Anything else; rejected after the handshake.
    #[serde(other)]
    Unknown,
}

/// Start parameters carried by an `ExtensionHost` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionHostParams {
    /// UI language forwarded to the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Requested debug port; replaced by the first free port found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Debug session identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_id: Option<String>,
    /// Whether the worker should break on entry.
    #[serde(default, rename = "break")]
    pub break_on_start: bool,
}

/// Arguments carried by a `Tunnel` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelParams {
    /// Local TCP port to bridge to.
    pub port: u16,
}

/// Server → client handshake replies, discriminated on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Challenge the client must sign.
    #[serde(rename = "sign")]
    Sign { data: String },
    /// Management accept (fresh or resume).
    #[serde(rename = "ok")]
    Ok,
    /// Terminal rejection; the socket closes after this.
    #[serde(rename = "error")]
    Error { reason: String },
}

/// Extension-host accept. Serializes as `{}` or `{"debugPort": n}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionHostAck {
    #[serde(
        rename = "debugPort",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub debug_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_shape() {
        let msg: HandshakeMessage =
            serde_json::from_str(r#"{"type":"auth","auth":"secret"}"#).unwrap();
        assert_eq!(
            msg,
            HandshakeMessage::Auth(AuthRequest {
                auth: "secret".into()
            })
        );
    }

    #[test]
    fn connection_type_message_shape() {
        let msg: HandshakeMessage = serde_json::from_str(
            r#"{
                "type": "connectionType",
                "signedData": "abc",
                "commit": "deadbeef",
                "isBuilt": true,
                "desiredConnectionType": "Management"
            }"#,
        )
        .unwrap();

        match msg {
            HandshakeMessage::ConnectionType(req) => {
                assert_eq!(req.signed_data, "abc");
                assert_eq!(req.commit.as_deref(), Some("deadbeef"));
                assert!(req.is_built);
                assert_eq!(
                    req.desired_connection_type,
                    DesiredConnectionType::Management
                );
                assert!(req.args.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_connection_type_is_not_a_parse_error() {
        let msg: HandshakeMessage = serde_json::from_str(
            r#"{"type":"connectionType","signedData":"","desiredConnectionType":"Telemetry"}"#,
        )
        .unwrap();
        match msg {
            HandshakeMessage::ConnectionType(req) => {
                assert_eq!(req.desired_connection_type, DesiredConnectionType::Unknown);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_envelope_type_is_a_parse_error() {
        let res = serde_json::from_str::<HandshakeMessage>(r#"{"type":"hello"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn extension_host_params_from_args() {
        let args = serde_json::json!({
            "language": "en",
            "port": 5870,
            "debugId": "dbg-1",
            "break": true
        });
        let params: ExtensionHostParams = serde_json::from_value(args).unwrap();
        assert_eq!(params.port, Some(5870));
        assert_eq!(params.debug_id.as_deref(), Some("dbg-1"));
        assert!(params.break_on_start);
    }

    #[test]
    fn server_replies_serialize_with_type_tag() {
        assert_eq!(
            serde_json::to_string(&ServerMessage::Ok).unwrap(),
            r#"{"type":"ok"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerMessage::Error {
                reason: "Duplicate reconnection token.".into()
            })
            .unwrap(),
            r#"{"type":"error","reason":"Duplicate reconnection token."}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerMessage::Sign {
                data: "blob".into()
            })
            .unwrap(),
            r#"{"type":"sign","data":"blob"}"#
        );
    }

    #[test]
    fn extension_host_ack_omits_missing_port() {
        assert_eq!(
            serde_json::to_string(&ExtensionHostAck { debug_port: None }).unwrap(),
            "{}"
        );
        assert_eq!(
            serde_json::to_string(&ExtensionHostAck {
                debug_port: Some(5870)
            })
            .unwrap(),
            r#"{"debugPort":5870}"#
        );
    }
}
