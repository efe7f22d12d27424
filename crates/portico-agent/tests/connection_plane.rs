//! End-to-end tests over real TCP sockets: upgrade, handshake, dispatch,
//! resume, tunnels, and idle shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use portico_agent::{
    supervisor, AgentListener, AgentState, AuthContext, ConnectionRegistry, Dispatcher,
    ProcessExtensionHostFactory, SupervisorHandle,
};
use portico_core::{FramedTransport, FramingMode};

const TOKEN: &str = "it-connection-token";

struct TestAgent {
    port: u16,
    registry: Arc<ConnectionRegistry>,
    shutdown_rx: mpsc::Receiver<i32>,
}

async fn start_agent(auto_shutdown_timeout: Option<Duration>) -> TestAgent {
    let registry = ConnectionRegistry::new();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let sup = match auto_shutdown_timeout {
        Some(timeout) => {
            let counter = Arc::clone(&registry);
            supervisor::spawn(
                timeout,
                registry.subscribe_events(),
                move || counter.extension_host_count(),
                shutdown_tx,
            )
        }
        None => SupervisorHandle::disabled(),
    };

    let factory = Arc::new(ProcessExtensionHostFactory::new(
        Some(PathBuf::from("cat")),
        Vec::new(),
    ));
    let dispatcher = Dispatcher::new(Arc::clone(&registry), factory, Duration::from_secs(60));
    let state = Arc::new(AgentState {
        dispatcher,
        auth: AuthContext::new(TOKEN.into(), Some("test-commit".into())),
        supervisor: sup,
        commit: Some("test-commit".into()),
        web_root: None,
    });

    let listener = AgentListener::bind("127.0.0.1:0".parse().unwrap(), state)
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(listener.run());

    TestAgent {
        port,
        registry,
        shutdown_rx,
    }
}

/// Upgrade a raw-framing connection and return the framed transport.
async fn connect_raw(port: u16, query: &str) -> FramedTransport {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET /?skipWebSocketFrames=true{query} HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let (head, leftover) = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected response: {head}");
    // RFC 6455 worked example: this key has a fixed accept token.
    assert!(
        head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
        "bad accept header: {head}"
    );

    FramedTransport::new(Box::new(stream), FramingMode::Raw, leftover)
}

async fn read_response_head(stream: &mut TcpStream) -> (String, Bytes) {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        assert!(buf.len() < 8192, "response head too large");
    }
    (String::from_utf8(buf).unwrap(), Bytes::new())
}

async fn send_json(t: &mut FramedTransport, value: serde_json::Value) {
    t.send_control(&serde_json::to_vec(&value).unwrap())
        .await
        .unwrap();
}

async fn recv_json(t: &mut FramedTransport) -> serde_json::Value {
    serde_json::from_slice(&t.recv_control().await.unwrap()).unwrap()
}

/// Run the full auth + connectionType exchange.
async fn handshake(
    t: &mut FramedTransport,
    desired: &str,
    args: Option<serde_json::Value>,
) -> serde_json::Value {
    send_json(t, serde_json::json!({"type": "auth", "auth": TOKEN})).await;
    let sign = recv_json(t).await;
    assert_eq!(sign["type"], "sign");

    let mut msg = serde_json::json!({
        "type": "connectionType",
        "signedData": TOKEN,
        "commit": "test-commit",
        "isBuilt": true,
        "desiredConnectionType": desired,
    });
    if let Some(args) = args {
        msg["args"] = args;
    }
    send_json(t, msg).await;
    recv_json(t).await
}

async fn plain_get(port: u16, path: &str) -> (String, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    let (head, body) = response
        .split_once("\r\n\r\n")
        .map(|(h, b)| (h.to_string(), b.to_string()))
        .unwrap();
    (head, body)
}

#[tokio::test]
async fn fresh_management_connection() {
    let agent = start_agent(None).await;
    let mut client = connect_raw(agent.port, "&reconnectionToken=m-1").await;

    let reply = handshake(&mut client, "Management", None).await;
    assert_eq!(reply, serde_json::json!({"type": "ok"}));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(agent.registry.management_count(), 1);
    assert!(agent.registry.resume_management("m-1").is_ok());
}

#[tokio::test]
async fn duplicate_token_rejected_original_responsive() {
    let agent = start_agent(None).await;

    let mut first = connect_raw(agent.port, "&reconnectionToken=dup").await;
    assert_eq!(
        handshake(&mut first, "Management", None).await["type"],
        "ok"
    );
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut second = connect_raw(agent.port, "&reconnectionToken=dup").await;
    let reply = handshake(&mut second, "Management", None).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["reason"], "Duplicate reconnection token.");

    // Original entry unaffected and still receiving.
    let conn = agent.registry.resume_management("dup").unwrap();
    let mut messages = conn.subscribe();
    first.send_control(b"ping-after-dup").await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got[..], b"ping-after-dup");
}

#[tokio::test]
async fn resume_unknown_token_rejected() {
    let agent = start_agent(None).await;
    let mut client =
        connect_raw(agent.port, "&reconnectionToken=ABC&reconnection=true").await;

    let reply = handshake(&mut client, "Management", None).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["reason"], "Unknown reconnection token.");
}

#[tokio::test]
async fn management_resume_after_socket_loss() {
    let agent = start_agent(None).await;

    let mut client = connect_raw(agent.port, "&reconnectionToken=res-1").await;
    assert_eq!(handshake(&mut client, "Management", None).await["type"], "ok");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let conn = agent.registry.resume_management("res-1").unwrap();
    let mut messages = conn.subscribe();

    // Transient network loss: entry stays.
    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.registry.management_count(), 1);

    let mut resumed =
        connect_raw(agent.port, "&reconnectionToken=res-1&reconnection=true").await;
    assert_eq!(
        handshake(&mut resumed, "Management", None).await["type"],
        "ok"
    );

    resumed.send_control(b"hello-again").await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got[..], b"hello-again");
}

#[tokio::test]
async fn extension_host_reports_debug_port() {
    let agent = start_agent(None).await;

    // Request a port that is known to be free right now.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let free = probe.local_addr().unwrap().port();
    drop(probe);

    let mut client = connect_raw(agent.port, "&reconnectionToken=xh-1").await;
    let reply = handshake(
        &mut client,
        "ExtensionHost",
        Some(serde_json::json!({"port": free})),
    )
    .await;
    assert_eq!(reply, serde_json::json!({"debugPort": free}));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.registry.extension_host_count(), 1);
    let conn = agent.registry.resume_extension_host("xh-1").unwrap();
    assert_eq!(conn.debug_port(), Some(free));
}

#[tokio::test]
async fn extension_host_worker_sees_post_handshake_bytes() {
    let agent = start_agent(None).await;

    let mut client = connect_raw(agent.port, "&reconnectionToken=xh-echo").await;
    let reply = handshake(&mut client, "ExtensionHost", None).await;
    assert_eq!(reply, serde_json::json!({}));

    // Everything after the handshake flows to the worker; cat echoes it.
    let (stream, leftover) = client.into_parts();
    let mut stream = stream.unwrap();
    assert!(leftover.is_empty());
    stream.write_all(b"worker-bound").await.unwrap();

    let mut buf = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"worker-bound");
}

#[tokio::test]
async fn tunnel_delivers_pipelined_bytes_and_pipes_both_ways() {
    let agent = start_agent(None).await;

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();

    let mut client = connect_raw(agent.port, "&reconnectionToken=tun-1").await;

    // Send the handshake and pipeline payload bytes right behind it,
    // before the server has attached the tunnel.
    send_json(&mut client, serde_json::json!({"type": "auth", "auth": TOKEN})).await;
    assert_eq!(recv_json(&mut client).await["type"], "sign");
    send_json(
        &mut client,
        serde_json::json!({
            "type": "connectionType",
            "signedData": TOKEN,
            "isBuilt": true,
            "desiredConnectionType": "Tunnel",
            "args": {"port": target_port},
        }),
    )
    .await;
    let (stream, leftover) = client.into_parts();
    let mut stream = stream.unwrap();
    assert!(leftover.is_empty());
    stream.write_all(b"early-bytes").await.unwrap();

    let (mut accepted, _) = target.accept().await.unwrap();
    let mut buf = [0u8; 11];
    tokio::time::timeout(Duration::from_secs(2), accepted.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"early-bytes");

    // Bidirectional piping holds.
    accepted.write_all(b"from-target").await.unwrap();
    let mut buf = [0u8; 11];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from-target");

    stream.write_all(b"from-client").await.unwrap();
    let mut buf = [0u8; 11];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from-client");
}

#[tokio::test]
async fn idle_shutdown_after_last_extension_host_closes() {
    let mut agent = start_agent(Some(Duration::from_millis(200))).await;

    let mut client = connect_raw(agent.port, "&reconnectionToken=xh-idle").await;
    assert_eq!(
        handshake(&mut client, "ExtensionHost", None).await,
        serde_json::json!({})
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(agent.registry.extension_host_count(), 1);

    // Terminal close, not socket loss.
    agent
        .registry
        .resume_extension_host("xh-idle")
        .unwrap()
        .close();

    let code = tokio::time::timeout(Duration::from_secs(3), agent.shutdown_rx.recv())
        .await
        .expect("shutdown should fire")
        .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn version_and_delay_shutdown_endpoints() {
    let agent = start_agent(None).await;

    let (head, body) = plain_get(agent.port, "/version").await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("Content-Type: text/html"));
    assert_eq!(body, "test-commit");

    let (head, body) = plain_get(agent.port, "/delay-shutdown").await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn non_get_method_is_refused() {
    let agent = start_agent(None).await;

    let mut stream = TcpStream::connect(("127.0.0.1", agent.port)).await.unwrap();
    stream
        .write_all(b"POST /version HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 500"));
    assert!(response.contains("Unsupported method POST"));
}

#[tokio::test]
async fn missing_ui_serves_404() {
    let agent = start_agent(None).await;
    let (head, body) = plain_get(agent.port, "/index.html").await;
    assert!(head.starts_with("HTTP/1.1 404"));
    assert_eq!(body, "Not found");
}

#[tokio::test]
async fn replayed_frames_after_resume_preserve_order() {
    let agent = start_agent(None).await;

    let mut client = connect_raw(agent.port, "&reconnectionToken=ord-1").await;
    assert_eq!(handshake(&mut client, "Management", None).await["type"], "ok");
    tokio::time::sleep(Duration::from_millis(30)).await;

    let conn = agent.registry.resume_management("ord-1").unwrap();
    let mut messages = conn.subscribe();
    drop(client);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Server-side messages queued while the client is gone.
    conn.send(Bytes::from_static(b"s1")).unwrap();
    conn.send(Bytes::from_static(b"s2")).unwrap();

    let mut resumed =
        connect_raw(agent.port, "&reconnectionToken=ord-1&reconnection=true").await;
    assert_eq!(
        handshake(&mut resumed, "Management", None).await["type"],
        "ok"
    );

    // The queued messages replay in order.
    assert_eq!(&resumed.recv_control().await.unwrap()[..], b"s1");
    assert_eq!(&resumed.recv_control().await.unwrap()[..], b"s2");

    // And the channel still works both ways.
    resumed.send_control(b"c1").await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got[..], b"c1");
}
