//! Per-connection state machine
//!
//! ```text
//! connected -> authenticating -> bridging -> closed
//!           \_______________________/
//!              (vpn-overlay mode)
//! ```
//!
//! Authentication reads one init message and validates its token; failure
//! closes the socket with 4001 before any process exists. Bridging runs one
//! session at a time on the socket: a `restart` request replaces it, every
//! other way out ends the connection. Whatever ends a session, it is handed
//! to `SessionManager::terminate` before the next step.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use ca_core::{AuthError, StreamError};
use ca_protocol::{
    classify_binary, classify_text, close_code, parse_init, ClientMessage, InboundFrame,
    InitMessage, ProtocolError, ServerMessage, SessionId, StatusKind, TerminalSize,
};

use super::context::RelayContext;
use crate::session::{
    spawn_pty_reader, spawn_pty_writer, CommandSpec, ProcessExit, PtySession, SessionIo,
    SessionManager,
};

/// Buffered chunks per direction
const CHANNEL_CAPACITY: usize = 64;

/// Input chunks held for the pty before the socket stops being read
const INPUT_BACKLOG: usize = 64;

/// Time allowed to flush output written just before the process exited
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Message shown to a client whose credential was rejected
const AUTH_FAILED_MESSAGE: &str = "Invalid or missing token";

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connected,
    Authenticating,
    Bridging,
    Closed,
}

/// Why a bridged session ended
#[derive(Debug)]
enum Outcome {
    /// Client asked for a fresh session
    Restart,
    /// The agent exited on its own
    ProcessExited(Option<ProcessExit>),
    /// Client closed the socket
    ClientClosed,
    /// Socket or pty I/O failed
    StreamFailure(StreamError),
    /// No frames from the client within the heartbeat timeout
    HeartbeatTimeout,
    /// Relay is stopping
    Shutdown,
}

/// Close code and reason sent when a connection ends
#[derive(Debug, Clone, Copy)]
struct CloseReason {
    code: u16,
    reason: &'static str,
}

impl CloseReason {
    const NORMAL: Self = Self {
        code: close_code::NORMAL,
        reason: "session ended",
    };
    const GOING_AWAY: Self = Self {
        code: close_code::GOING_AWAY,
        reason: "relay shutting down",
    };
    const AUTH_REJECTED: Self = Self {
        code: close_code::AUTH_REJECTED,
        reason: "authentication failed",
    };
    const SPAWN_FAILED: Self = Self {
        code: close_code::SPAWN_FAILED,
        reason: "session could not be started",
    };
    const HEARTBEAT_TIMEOUT: Self = Self {
        code: close_code::HEARTBEAT_TIMEOUT,
        reason: "heartbeat timeout",
    };
}

/// One accepted WebSocket
struct Connection {
    peer: SocketAddr,
    phase: ConnectionPhase,
    tx: SplitSink<WebSocket, Message>,
    rx: SplitStream<WebSocket>,
    last_seen: Instant,
    /// Input that arrived before the first session existed
    pending_input: Vec<Bytes>,
}

impl Connection {
    fn new(peer: SocketAddr, socket: WebSocket) -> Self {
        let (tx, rx) = socket.split();
        Self {
            peer,
            phase: ConnectionPhase::Connected,
            tx,
            rx,
            last_seen: Instant::now(),
            pending_input: Vec::new(),
        }
    }

    fn enter(&mut self, phase: ConnectionPhase) {
        tracing::debug!("{}: {:?} -> {:?}", self.peer, self.phase, phase);
        self.phase = phase;
    }

    async fn send_message(&mut self, message: ServerMessage) -> Result<(), StreamError> {
        self.tx
            .send(Message::Text(message.to_json()))
            .await
            .map_err(|e| StreamError::Socket(e.to_string()))
    }

    async fn send_status(&mut self, status: StatusKind, text: impl Into<String>) -> Result<(), StreamError> {
        self.send_message(ServerMessage::status(status, text)).await
    }

    async fn send_output(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.tx
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| StreamError::Socket(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) {
        let frame = CloseFrame {
            code: reason.code,
            reason: reason.reason.into(),
        };
        if let Err(e) = self.tx.send(Message::Close(Some(frame))).await {
            tracing::trace!("{}: close frame not sent: {}", self.peer, e);
        }
        self.enter(ConnectionPhase::Closed);
    }
}

/// Terminates a session if the handler is dropped before doing so itself
struct TerminateOnDrop {
    sessions: Arc<SessionManager>,
    id: SessionId,
    armed: bool,
}

impl TerminateOnDrop {
    fn new(sessions: Arc<SessionManager>, id: SessionId) -> Self {
        Self {
            sessions,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let sessions = Arc::clone(&self.sessions);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    sessions.terminate(id).await;
                });
            }
            Err(_) => tracing::error!("No runtime to terminate {} on drop", id),
        }
    }
}

/// Drive one WebSocket connection to completion
pub async fn handle_socket(
    socket: WebSocket,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
    shutdown: CancellationToken,
) {
    let mut conn = Connection::new(peer, socket);
    tracing::info!("Client connected: {} ({} mode)", peer, ctx.mode);

    let init = if ctx.mode.requires_token() {
        conn.enter(ConnectionPhase::Authenticating);
        let result = tokio::select! {
            result = authenticate(&mut conn, &ctx) => result,
            _ = shutdown.cancelled() => {
                conn.close(CloseReason::GOING_AWAY).await;
                return;
            }
        };
        match result {
            Ok(init) => {
                tracing::info!("Authenticated {}", peer);
                init
            }
            Err(e) => {
                tracing::warn!("Authentication failed for {}: {}", peer, e);
                if e != AuthError::Disconnected {
                    let _ = conn.send_status(StatusKind::AuthFailed, AUTH_FAILED_MESSAGE).await;
                }
                conn.close(CloseReason::AUTH_REJECTED).await;
                return;
            }
        }
    } else {
        match optional_init(&mut conn, ctx.timeouts.init_window).await {
            Some(init) => init,
            None => {
                tracing::info!("Client {} left before a session started", peer);
                conn.enter(ConnectionPhase::Closed);
                return;
            }
        }
    };

    tracing::debug!("Init from {}: {:?}", peer, init);
    conn.enter(ConnectionPhase::Bridging);
    let reason = run_sessions(&mut conn, &ctx, &init, &shutdown).await;
    conn.close(reason).await;
    tracing::info!("Connection from {} closed ({})", peer, reason.reason);
}

async fn read_init(conn: &mut Connection) -> Result<InitMessage, AuthError> {
    loop {
        match conn.rx.next().await {
            Some(Ok(Message::Text(text))) => {
                return parse_init(&text).map_err(|e| AuthError::Malformed(e.to_string()));
            }
            Some(Ok(Message::Binary(data))) => {
                return Err(AuthError::Malformed(
                    ProtocolError::BinaryControl(data.len()).to_string(),
                ));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                return Err(AuthError::Disconnected);
            }
        }
    }
}

/// Read the init message and validate its token
async fn authenticate(conn: &mut Connection, ctx: &RelayContext) -> Result<InitMessage, AuthError> {
    let init = tokio::time::timeout(ctx.timeouts.auth, read_init(conn))
        .await
        .map_err(|_| AuthError::Timeout)??;

    let token = init.token.as_deref().ok_or(AuthError::MissingToken)?;
    if !ctx.tokens.validate(token.as_bytes()) {
        return Err(AuthError::InvalidToken);
    }
    Ok(init)
}

/// Give a vpn-overlay client a short window to describe its session
///
/// Returns `None` if the client disconnected. Input that arrives first is
/// kept for the session.
async fn optional_init(conn: &mut Connection, window: Duration) -> Option<InitMessage> {
    let frame = match tokio::time::timeout(window, conn.rx.next()).await {
        Ok(frame) => frame,
        Err(_) => return Some(InitMessage::default()),
    };

    match frame {
        Some(Ok(Message::Text(text))) => match classify_text(&text) {
            InboundFrame::Control(ClientMessage::Init(init)) => Some(init),
            InboundFrame::Control(ClientMessage::Resize { cols, rows }) => Some(InitMessage {
                cols: Some(cols),
                rows: Some(rows),
                ..Default::default()
            }),
            InboundFrame::Control(other) => {
                tracing::debug!("Ignoring {} before session start", other.kind());
                Some(InitMessage::default())
            }
            InboundFrame::Input(data) => {
                conn.pending_input.push(data);
                Some(InitMessage::default())
            }
        },
        Some(Ok(Message::Binary(data))) => {
            conn.pending_input.push(Bytes::from(data));
            Some(InitMessage::default())
        }
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Some(InitMessage::default()),
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => None,
    }
}

/// Run sessions on the connection until it must close
async fn run_sessions(
    conn: &mut Connection,
    ctx: &RelayContext,
    init: &InitMessage,
    shutdown: &CancellationToken,
) -> CloseReason {
    let mut size = init.size();

    loop {
        if conn.send_status(StatusKind::Starting, "Starting agent...").await.is_err() {
            return CloseReason::NORMAL;
        }

        let spec = CommandSpec::for_agent(&ctx.agent, init.cwd.as_deref(), size);
        let (session, io) = match ctx.sessions.create_session(spec) {
            Ok(created) => created,
            Err(e) => {
                tracing::error!("Failed to start session for {}: {}", conn.peer, e);
                let _ = conn.send_status(StatusKind::SpawnFailed, e.to_string()).await;
                return CloseReason::SPAWN_FAILED;
            }
        };

        let id = session.id();
        let guard = TerminateOnDrop::new(Arc::clone(&ctx.sessions), id);
        let outcome = bridge(conn, ctx, &session, io, &mut size, shutdown).await;
        ctx.sessions.terminate(id).await;
        guard.disarm();

        tracing::info!("{} for {} ended: {:?}", id, conn.peer, outcome);

        match outcome {
            Outcome::Restart => continue,
            Outcome::ProcessExited(exit) => {
                let text = match exit.and_then(|e| e.code) {
                    Some(code) => format!("Agent session ended (exit code {})", code),
                    None => "Agent session ended".to_string(),
                };
                let _ = conn.send_status(StatusKind::SessionEnded, text).await;
                return CloseReason::NORMAL;
            }
            Outcome::ClientClosed => return CloseReason::NORMAL,
            Outcome::StreamFailure(e) => {
                tracing::warn!("Stream failure for {}: {}", conn.peer, e);
                let _ = conn
                    .send_status(StatusKind::SessionEnded, format!("Connection lost: {}", e))
                    .await;
                return CloseReason::NORMAL;
            }
            Outcome::HeartbeatTimeout => {
                tracing::warn!(
                    "{}",
                    StreamError::HeartbeatTimeout(ctx.timeouts.heartbeat_timeout)
                );
                return CloseReason::HEARTBEAT_TIMEOUT;
            }
            Outcome::Shutdown => {
                let _ = conn
                    .send_status(StatusKind::SessionEnded, "Relay shutting down")
                    .await;
                return CloseReason::GOING_AWAY;
            }
        }
    }
}

/// Pump bytes between the socket and one session
async fn bridge(
    conn: &mut Connection,
    ctx: &RelayContext,
    session: &Arc<PtySession>,
    io: SessionIo,
    size: &mut TerminalSize,
    shutdown: &CancellationToken,
) -> Outcome {
    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    spawn_pty_reader(Arc::clone(session), io.reader, output_tx);
    spawn_pty_writer(Arc::clone(session), io.writer, input_rx);

    if let Err(e) = conn.send_status(StatusKind::Ready, "Agent is ready").await {
        tracing::debug!("Client gone before ready: {}", e);
        return Outcome::ClientClosed;
    }

    // Input waits here until the writer has room; the loop never blocks on
    // a process that is not reading.
    let mut backlog: VecDeque<Bytes> = std::mem::take(&mut conn.pending_input).into();

    let interval = ctx.timeouts.heartbeat_period();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exited = session.exited();
    tokio::pin!(exited);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Outcome::Shutdown,

            permit = input_tx.reserve(), if !backlog.is_empty() => match (permit, backlog.pop_front()) {
                (Ok(permit), Some(data)) => permit.send(data),
                (Ok(_), None) => {}
                (Err(_), _) => return Outcome::StreamFailure(pty_closed()),
            },

            frame = conn.rx.next(), if backlog.len() < INPUT_BACKLOG => {
                conn.last_seen = Instant::now();
                let inbound = match frame {
                    Some(Ok(Message::Binary(data))) => classify_binary(data),
                    Some(Ok(Message::Text(text))) => classify_text(&text),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return Outcome::ClientClosed,
                    Some(Err(e)) => return Outcome::StreamFailure(StreamError::Socket(e.to_string())),
                };

                match inbound {
                    InboundFrame::Input(data) => backlog.push_back(data),
                    InboundFrame::Control(ClientMessage::Resize { cols, rows }) => {
                        *size = TerminalSize::new(rows, cols);
                        if let Err(e) = session.resize(*size) {
                            tracing::warn!("Failed to resize {}: {}", session.id(), e);
                        }
                    }
                    InboundFrame::Control(ClientMessage::Init(init)) => {
                        if init.cols.is_some() || init.rows.is_some() {
                            *size = init.size();
                            if let Err(e) = session.resize(*size) {
                                tracing::warn!("Failed to resize {}: {}", session.id(), e);
                            }
                        }
                    }
                    InboundFrame::Control(ClientMessage::Restart) => return Outcome::Restart,
                    InboundFrame::Control(ClientMessage::Ping) => {
                        if let Err(e) = conn.send_message(ServerMessage::Pong).await {
                            return Outcome::StreamFailure(e);
                        }
                    }
                }
            }

            chunk = output_rx.recv() => match chunk {
                Some(data) => {
                    if let Err(e) = conn.send_output(data).await {
                        return Outcome::StreamFailure(e);
                    }
                }
                None => {
                    let exit = tokio::time::timeout(ctx.sessions.grace(), session.exited())
                        .await
                        .ok();
                    return Outcome::ProcessExited(exit);
                }
            },

            exit = &mut exited => {
                while let Ok(Some(data)) = tokio::time::timeout(DRAIN_TIMEOUT, output_rx.recv()).await {
                    if conn.send_output(data).await.is_err() {
                        break;
                    }
                }
                return Outcome::ProcessExited(Some(exit));
            }

            _ = heartbeat.tick() => {
                if conn.last_seen.elapsed() >= ctx.timeouts.heartbeat_timeout {
                    return Outcome::HeartbeatTimeout;
                }
                if let Err(e) = conn.tx.send(Message::Ping(Vec::new())).await {
                    return Outcome::StreamFailure(StreamError::Socket(e.to_string()));
                }
            }
        }
    }
}

fn pty_closed() -> StreamError {
    StreamError::Pty(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "pty input closed",
    ))
}
