//! `SwitchboardServer`: Axum HTTP + WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use switchboard_auth::select_credential;
use switchboard_core::errors as codes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{Span, error, info, info_span, warn};

use crate::health::{self, HealthResponse};
use crate::manager::ConnectionManager;
use crate::stats::StatsSnapshot;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The connection manager.
    pub manager: Arc<ConnectionManager>,
    /// Renders `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

/// The switchboard server.
pub struct SwitchboardServer {
    manager: Arc<ConnectionManager>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl SwitchboardServer {
    /// Create a server around an already wired manager.
    pub fn new(manager: Arc<ConnectionManager>, metrics: PrometheusHandle) -> Self {
        Self {
            manager,
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http().make_span_with(request_span))
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve in a background task.
    ///
    /// The listener keeps answering (upgrades get 503) while a drain is in
    /// progress and stops once the drain has emptied the registry.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let config = self.manager.config();
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "switchboard server listening");

        let router = self.router();
        let manager = self.manager.clone();
        let handle = tokio::spawn(async move {
            let stop = async move {
                manager.shutdown().token().cancelled().await;
                manager.registry().wait_until_empty().await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(stop)
                .await
            {
                error!(error = %e, "server error");
            }
            info!("http listener stopped");
        });
        Ok((addr, handle))
    }

    /// The connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

/// Span for an HTTP request. Records the path only: the query string may
/// carry a credential.
fn request_span(req: &Request<Body>) -> Span {
    info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        version = ?req.version(),
    )
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.manager.registry();
    Json(health::health_check(
        state.start_time,
        registry.connection_count(),
        registry.session_count(),
        state.manager.is_draining(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.manager.stats())
}

/// Handshake parameters on the upgrade request.
#[derive(Debug, Default, Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
) -> Response {
    if state.manager.is_draining() {
        return (StatusCode::SERVICE_UNAVAILABLE, codes::SERVER_SHUTTING_DOWN).into_response();
    }
    if !state.manager.has_capacity() {
        warn!(
            max = state.manager.config().max_connections,
            "connection limit reached, refusing upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, codes::CONNECTION_LIMIT_REACHED).into_response();
    }

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let credential = select_credential(query.token.as_deref(), authorization).map(str::to_owned);
    let max_message_size = state.manager.config().max_message_size;
    let manager = state.manager;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, manager, credential))
}
