//! `EntangleServer`: axum HTTP and WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::registry::Registry;
use crate::shutdown::{DrainReport, ShutdownCoordinator};
use crate::websocket::{Heartbeat, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Services and sessions.
    pub registry: Arc<Registry>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Ping timing handed to every connection.
    pub heartbeat: Heartbeat,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The entangle server.
pub struct EntangleServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl EntangleServer {
    /// Create a server with an empty registry built from `config`.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new(&config));
        Self::with_registry(config, registry)
    }

    /// Create a server around an existing registry.
    pub fn with_registry(config: ServerConfig, registry: Arc<Registry>) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new(config.shutdown_timeout()));
        Self {
            config,
            registry,
            shutdown,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            heartbeat: Heartbeat {
                interval: self.config.heartbeat_interval().max(Duration::from_secs(1)),
                timeout: self.config.heartbeat_timeout(),
            },
            max_message_size: self.config.max_message_size,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until [`ServerHandle::stop`].
    pub async fn listen(&self) -> Result<ServerHandle, std::io::Error> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%addr, "entangle server listening");

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
        });

        Ok(ServerHandle {
            addr,
            task,
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
        })
    }

    /// Services and sessions.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Handle to a listening server.
pub struct ServerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
    registry: Arc<Registry>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ServerHandle {
    /// Bound address (resolves port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of the WebSocket endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Stop accepting and drain every session, forcing the ones that
    /// outlive `shutdown_timeout_secs`.
    pub async fn stop(self) -> DrainReport {
        self.shutdown.drain(&self.registry, self.task).await
    }

    /// Wait until the listener exits.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let (session, outbound) = state.registry.accept();
            run_ws_session(
                socket,
                Arc::clone(&state.registry),
                session,
                outbound,
                state.heartbeat,
                state.shutdown.token(),
            )
            .await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.session_count(),
        state.registry.service_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
