//! WebSocket listener
//!
//! Binds the address chosen by the network resolver and upgrades every
//! request to a relay connection, whatever its path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ca_core::{BindDecision, BindError};

use super::context::RelayContext;
use super::handler::handle_socket;
use crate::session::SessionManager;

/// Extra time connection handlers get beyond the termination grace period
const HANDLER_DRAIN_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    ctx: Arc<RelayContext>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// WebSocket relay server
pub struct RelayServer;

impl RelayServer {
    /// Bind `decision` and start serving in the background
    ///
    /// A port of 0 binds an ephemeral port; the returned handle reports the
    /// port actually used.
    pub async fn start(decision: BindDecision, ctx: RelayContext) -> Result<RelayHandle, BindError> {
        let addr = decision.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BindError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BindError::Listen { addr, source })?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let sessions = Arc::clone(&ctx.sessions);
        let mode = ctx.mode;

        let app = Router::new()
            .route("/", get(upgrade))
            .route("/*path", get(upgrade))
            .with_state(AppState {
                ctx: Arc::new(ctx),
                shutdown: shutdown.clone(),
                tracker: tracker.clone(),
            });

        let serve_shutdown = shutdown.clone();
        let join = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await;

            match result {
                Ok(()) => tracing::info!("Relay server on {} stopped", local_addr),
                Err(e) => tracing::error!("Relay server on {} failed: {}", local_addr, e),
            }
        });

        tracing::info!("Relay listening on ws://{} ({} mode)", local_addr, mode);

        Ok(RelayHandle {
            decision: BindDecision::new(local_addr.ip(), local_addr.port(), decision.mode),
            shutdown,
            tracker,
            join,
            sessions,
        })
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    tracing::debug!("Upgrade request from {}", peer);
    let AppState {
        ctx,
        shutdown,
        tracker,
    } = state;
    ws.on_upgrade(move |socket| tracker.track_future(handle_socket(socket, peer, ctx, shutdown)))
}

/// A running relay listener
pub struct RelayHandle {
    decision: BindDecision,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    join: JoinHandle<()>,
    sessions: Arc<SessionManager>,
}

impl RelayHandle {
    /// Address and mode actually bound
    pub fn decision(&self) -> &BindDecision {
        &self.decision
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.decision.socket_addr()
    }

    /// Whether the accept loop is still running
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Stop accepting, close every connection, and terminate every session
    pub async fn stop(self) {
        tracing::info!("Stopping relay on {}", self.decision);
        self.shutdown.cancel();

        if let Err(e) = self.join.await {
            tracing::error!("Relay server task failed: {}", e);
        }

        self.tracker.close();
        let drain = self.sessions.grace() + HANDLER_DRAIN_SLACK;
        if tokio::time::timeout(drain, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                "{} connection handlers still running after {:?}",
                self.tracker.len(),
                drain
            );
        }

        self.sessions.terminate_all().await;
        tracing::info!("Relay on {} stopped", self.decision);
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("decision", &self.decision)
            .field("connections", &self.tracker.len())
            .finish()
    }
}
