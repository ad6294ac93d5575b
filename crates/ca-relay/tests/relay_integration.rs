//! End-to-end relay tests
//!
//! Runs a real listener on 127.0.0.1 with `cat`/`sh` standing in for the
//! agent CLI and drives it with a WebSocket client.

#![cfg(unix)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use ca_core::config::RelayConfig;
use ca_core::{AuthToken, BindDecision, NetworkMode, TokenStore};
use ca_relay::{RelayContext, RelayHandle, RelayServer, SessionManager};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    handle: RelayHandle,
    sessions: Arc<SessionManager>,
    token: AuthToken,
}

impl Relay {
    fn url(&self) -> String {
        format!("ws://{}/", self.handle.local_addr())
    }
}

fn test_config(program: &str, args: &[&str]) -> RelayConfig {
    let mut config = RelayConfig {
        termination_grace: Duration::from_secs(1),
        auth_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    config.agent.program = Some(program.to_string());
    config.agent.args = args.iter().map(|s| s.to_string()).collect();
    config
}

async fn start_relay(mode: NetworkMode, config: RelayConfig) -> Relay {
    let token = AuthToken::generate();
    let tokens = Arc::new(TokenStore::in_memory(token.clone()));
    let sessions = Arc::new(SessionManager::from_config(&config));
    let ctx = RelayContext::new(mode, &config, tokens, Arc::clone(&sessions));
    let decision = BindDecision::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, mode);

    let handle = RelayServer::start(decision, ctx).await.unwrap();
    Relay {
        handle,
        sessions,
        token,
    }
}

async fn connect(relay: &Relay) -> Client {
    let (ws, _) = connect_async(relay.url()).await.unwrap();
    ws
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn send_init(ws: &mut Client, token: &str) {
    send_json(
        ws,
        json!({"type": "init", "token": token, "cols": 80, "rows": 24}),
    )
    .await;
}

/// Next JSON text frame, skipping terminal output
async fn next_json(ws: &mut Client) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Close(frame))) => panic!("closed while waiting for json: {frame:?}"),
                Some(Ok(_)) => continue,
                other => panic!("unexpected end of stream: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a json frame")
}

async fn expect_status(ws: &mut Client, status: &str) -> Value {
    let msg = next_json(ws).await;
    assert_eq!(msg["type"], "status", "got {msg}");
    assert_eq!(msg["status"], status, "got {msg}");
    msg
}

/// Accumulate binary output until it contains `needle`
async fn read_output_until(ws: &mut Client, needle: &str) -> String {
    tokio::time::timeout(WAIT, async {
        let mut output = Vec::new();
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    output.extend_from_slice(&data);
                    let text = String::from_utf8_lossy(&output).into_owned();
                    if text.contains(needle) {
                        return text;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("stream ended before {needle:?}: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for output")
}

/// Close code the server ends the connection with
async fn expect_close(ws: &mut Client) -> u16 {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(Message::Close(None))) => panic!("close without a code"),
                Some(Ok(_)) => continue,
                other => panic!("stream ended without a close frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for close")
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

fn only_session_pid(sessions: &SessionManager) -> u32 {
    let ids = sessions.list();
    assert_eq!(ids.len(), 1, "expected exactly one session, got {ids:?}");
    sessions.get(ids[0]).unwrap().pid().unwrap()
}

#[tokio::test]
async fn test_authenticated_echo() {
    let relay = start_relay(NetworkMode::LocalSubnet, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    send_init(&mut ws, relay.token.as_str()).await;
    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;

    ws.send(Message::Binary(b"ls\n".to_vec())).await.unwrap();
    let output = read_output_until(&mut ws, "ls").await;
    assert!(output.contains("ls"));

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_input_order_is_preserved() {
    let relay = start_relay(NetworkMode::LocalSubnet, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    send_init(&mut ws, relay.token.as_str()).await;
    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;

    for line in ["alpha\n", "bravo\n", "charlie\n"] {
        ws.send(Message::Binary(line.as_bytes().to_vec())).await.unwrap();
    }
    let output = read_output_until(&mut ws, "charlie").await;

    let a = output.find("alpha").unwrap();
    let b = output.find("bravo").unwrap();
    let c = output.find("charlie").unwrap();
    assert!(a < b && b < c, "out of order: {output:?}");

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_wrong_token_rejected_without_session() {
    let relay = start_relay(NetworkMode::LocalSubnet, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    send_init(&mut ws, "wrong").await;
    let msg = expect_status(&mut ws, "auth_failed").await;
    assert_eq!(msg["message"], "Invalid or missing token");
    assert_eq!(expect_close(&mut ws).await, 4001);
    assert!(relay.sessions.is_empty());

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_missing_init_rejected_in_local_mode() {
    let relay = start_relay(NetworkMode::LocalSubnet, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "auth_failed").await;
    assert_eq!(expect_close(&mut ws).await, 4001);
    assert!(relay.sessions.is_empty());

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_vpn_mode_bridges_without_token() {
    let relay = start_relay(NetworkMode::VpnOverlay, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;
    assert_eq!(relay.sessions.len(), 1);

    ws.send(Message::Binary(b"overlay\n".to_vec())).await.unwrap();
    read_output_until(&mut ws, "overlay").await;

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_disconnect_kills_process() {
    let relay = start_relay(NetworkMode::VpnOverlay, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;
    let pid = only_session_pid(&relay.sessions);
    assert!(is_alive(pid));

    ws.close(None).await.unwrap();
    drop(ws);

    let sessions = Arc::clone(&relay.sessions);
    assert!(wait_until(|| sessions.is_empty()).await, "session not removed");
    assert!(wait_until(|| !is_alive(pid)).await, "process {pid} still alive");

    relay.handle.stop().await;
}

/// Agent that echoes raw bytes once `READY` has been printed
fn raw_cat_config() -> RelayConfig {
    test_config("/bin/sh", &["-c", "stty raw -echo; echo READY; exec cat"])
}

const FLOOD_CHUNK: usize = 4096;
const FLOOD_CHUNKS: usize = 400;

#[tokio::test]
async fn test_input_flood_keeps_output_flowing() {
    let relay = start_relay(NetworkMode::VpnOverlay, raw_cat_config()).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;
    read_output_until(&mut ws, "READY").await;

    let (mut sink, mut stream) = ws.split();
    let sender = tokio::spawn(async move {
        for _ in 0..FLOOD_CHUNKS {
            sink.send(Message::Binary(vec![b'a'; FLOOD_CHUNK])).await.unwrap();
        }
        sink
    });

    let expected = FLOOD_CHUNK * FLOOD_CHUNKS;
    let received = tokio::time::timeout(Duration::from_secs(30), async {
        let mut received = 0;
        while received < expected {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => received += data.len(),
                Some(Ok(_)) => continue,
                other => panic!("stream ended after {received} bytes: {other:?}"),
            }
        }
        received
    })
    .await
    .expect("echo stalled");
    assert!(received >= expected);

    let _sink = sender.await.unwrap();
    relay.handle.stop().await;
}

#[tokio::test]
async fn test_disconnect_during_input_flood_kills_process() {
    let relay = start_relay(NetworkMode::VpnOverlay, raw_cat_config()).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;
    read_output_until(&mut ws, "READY").await;
    let pid = only_session_pid(&relay.sessions);

    // Never read the echo; sending stalls once every buffer is full.
    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        for _ in 0..FLOOD_CHUNKS {
            if ws.send(Message::Binary(vec![b'a'; FLOOD_CHUNK])).await.is_err() {
                break;
            }
        }
    })
    .await;
    drop(ws);

    let sessions = Arc::clone(&relay.sessions);
    assert!(wait_until(|| sessions.is_empty()).await, "session not removed");
    assert!(wait_until(|| !is_alive(pid)).await, "process {pid} still alive");

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_zero_heartbeat_interval_is_clamped() {
    let config = RelayConfig {
        heartbeat_interval: Duration::ZERO,
        heartbeat_timeout: Duration::from_secs(5),
        ..test_config("/bin/cat", &[])
    };
    let relay = start_relay(NetworkMode::VpnOverlay, config).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;
    ws.send(Message::Binary(b"still here\n".to_vec())).await.unwrap();
    read_output_until(&mut ws, "still here").await;

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_restart_replaces_session() {
    let relay = start_relay(NetworkMode::VpnOverlay, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;
    let first_id = relay.sessions.list()[0];
    let first_pid = only_session_pid(&relay.sessions);

    send_json(&mut ws, json!({"type": "restart"})).await;
    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;

    let ids = relay.sessions.list();
    assert_eq!(ids.len(), 1);
    assert_ne!(ids[0], first_id);
    assert!(wait_until(|| !is_alive(first_pid)).await);

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let relay = start_relay(NetworkMode::VpnOverlay, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;

    send_json(&mut ws, json!({"type": "ping"})).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg, json!({"type": "pong"}));

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_resize_reaches_terminal() {
    let relay = start_relay(NetworkMode::VpnOverlay, test_config("/bin/sh", &[])).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;

    send_json(&mut ws, json!({"type": "resize", "cols": 101, "rows": 37})).await;
    ws.send(Message::Binary(b"stty size\n".to_vec())).await.unwrap();
    read_output_until(&mut ws, "37 101").await;

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_process_exit_ends_connection() {
    let relay = start_relay(
        NetworkMode::VpnOverlay,
        test_config("/bin/sh", &["-c", "echo finished"]),
    )
    .await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;
    read_output_until(&mut ws, "finished").await;
    expect_status(&mut ws, "session_ended").await;
    assert_eq!(expect_close(&mut ws).await, 1000);

    let sessions = Arc::clone(&relay.sessions);
    assert!(wait_until(|| sessions.is_empty()).await);

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_spawn_failure_reported() {
    let relay = start_relay(
        NetworkMode::VpnOverlay,
        test_config("/nonexistent/agent-binary", &[]),
    )
    .await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "spawn_failed").await;
    assert_eq!(expect_close(&mut ws).await, 4002);
    assert!(relay.sessions.is_empty());

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_heartbeat_timeout_closes_silent_client() {
    let config = RelayConfig {
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(2),
        ..test_config("/bin/cat", &[])
    };
    let relay = start_relay(NetworkMode::VpnOverlay, config).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;

    // Stay silent: without reads the client never answers pings.
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(expect_close(&mut ws).await, 4003);
    let sessions = Arc::clone(&relay.sessions);
    assert!(wait_until(|| sessions.is_empty()).await);

    relay.handle.stop().await;
}

#[tokio::test]
async fn test_stop_terminates_sessions() {
    let relay = start_relay(NetworkMode::VpnOverlay, test_config("/bin/cat", &[])).await;
    let mut ws = connect(&relay).await;

    expect_status(&mut ws, "starting").await;
    expect_status(&mut ws, "ready").await;
    let pid = only_session_pid(&relay.sessions);
    let sessions = Arc::clone(&relay.sessions);

    relay.handle.stop().await;

    expect_status(&mut ws, "session_ended").await;
    assert_eq!(expect_close(&mut ws).await, 1001);
    assert!(sessions.is_empty());
    assert!(wait_until(|| !is_alive(pid)).await);
}
