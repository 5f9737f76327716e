//! Reference gateway server
//!
//! A small axum WebSocket endpoint that wires the protocol core together:
//! challenge and handshake verification, the peer and node registries,
//! broadcast fan-out, a handful of RPC methods, and the tick and maintenance
//! timers. It is enough to run the core end to end; it is not a control plane.
//!
//! ```text
//!   operators ─┐                         ┌─► Broadcaster ─► peers
//!              ├─► /  (ws) ─► connection ┼─► NodeRegistry ─► nodes
//!   nodes ─────┘                         ├─► ExecApprovalManager
//!                                        └─► ChatRunCoordinator ◄─ RunEventBus
//! ```

pub mod auth;
mod connection;
pub mod methods;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub use auth::{Authenticated, DeviceTokens, SharedAuth, authenticate};

use crate::approvals::ExecApprovalManager;
use crate::broadcast::{BroadcastOpts, Broadcaster};
use crate::chat::ChatRunCoordinator;
use crate::config::ServerConfig;
use crate::events::RunEventBus;
use crate::nodes::{NodeCommandPolicy, NodeRegistry};
use crate::protocol::{close, events, now_ms};
use crate::{Error, Result};

/// Interval of the chat expiry sweep
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state behind every connection
#[derive(Debug)]
pub struct GatewayState {
    pub config: ServerConfig,
    pub broadcaster: Arc<Broadcaster>,
    pub nodes: Arc<NodeRegistry>,
    pub events: Arc<RunEventBus>,
    pub chat: Arc<ChatRunCoordinator>,
    pub approvals: Arc<ExecApprovalManager>,
    pub node_policy: NodeCommandPolicy,
    pub shared_auth: SharedAuth,
    pub device_tokens: DeviceTokens,
    /// Hostname reported in hello-ok
    pub host: String,
    pub started_at_ms: i64,
    shutdown: CancellationToken,
}

impl GatewayState {
    /// Build the component graph for `config`
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let broadcaster = Arc::new(Broadcaster::new(config.max_buffered_bytes));
        let events = Arc::new(RunEventBus::new());
        let chat = Arc::new(ChatRunCoordinator::new(broadcaster.clone(), events.clone()));

        let fanout = broadcaster.clone();
        events.subscribe(move |event| {
            let Ok(payload) = serde_json::to_value(event) else {
                return;
            };
            if let Some(session_key) = &event.session_key {
                fanout.send_to_session(session_key, events::AGENT, payload.clone());
            }
            fanout.broadcast(events::AGENT, payload, BroadcastOpts::droppable());
        });

        let shared_auth = SharedAuth {
            token: config.token.clone(),
            password: config.password.clone(),
        };
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Arc::new(Self {
            config,
            broadcaster,
            nodes: Arc::new(NodeRegistry::new()),
            events,
            chat,
            approvals: Arc::new(ExecApprovalManager::new()),
            node_policy: NodeCommandPolicy::default(),
            shared_auth,
            device_tokens: DeviceTokens::default(),
            host,
            started_at_ms: now_ms(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Tell peers the gateway is going away and stop the server
    pub fn shutdown(&self, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(reason = %reason, peers = self.broadcaster.len(), "gateway shutting down");
        self.broadcaster.broadcast(
            events::SHUTDOWN,
            json!({ "reason": reason, "restartExpectedMs": null }),
            BroadcastOpts::default(),
        );
        self.broadcaster.close_all(close::SERVICE_RESTART, reason);
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Build the gateway router
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/", get(connection::ws_upgrade))
        .route("/ws", get(connection::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Gateway server bound to a listener
#[derive(Debug)]
pub struct GatewayServer {
    state: Arc<GatewayState>,
    listener: TcpListener,
}

impl GatewayServer {
    /// Bind the configured address
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.bind, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind gateway on {addr}: {e}")))?;
        Ok(Self {
            state: GatewayState::new(config),
            listener,
        })
    }

    #[must_use]
    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Address actually bound (useful with port 0)
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until [`GatewayState::shutdown`] is called
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, "gateway listening");

        let timers = tokio::spawn(run_timers(self.state.clone()));
        let shutdown = self.state.shutdown.clone();

        let served = axum::serve(
            self.listener,
            router(self.state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;

        timers.abort();
        served.map_err(|e| Error::Transport(format!("gateway server error: {e}")))
    }

    /// Run the server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

/// Tick broadcast and chat expiry sweep
async fn run_timers(state: Arc<GatewayState>) {
    let tick_every = Duration::from_millis(state.config.tick_interval_ms);
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + tick_every, tick_every);
    let mut maintenance = tokio::time::interval_at(
        tokio::time::Instant::now() + MAINTENANCE_INTERVAL,
        MAINTENANCE_INTERVAL,
    );

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => break,
            _ = tick.tick() => {
                state.broadcaster.broadcast(
                    events::TICK,
                    json!({ "ts": now_ms() }),
                    BroadcastOpts::droppable(),
                );
            }
            _ = maintenance.tick() => {
                let expired = state.chat.sweep_expired(now_ms());
                if !expired.is_empty() {
                    tracing::info!(count = expired.len(), "swept expired chat runs");
                }
            }
        }
    }
}
