//! Control API, Event Stream and Health Endpoints
//!
//! HTTP front end for the gateway session. Commands go through
//! [`SessionController`]; observers attach to the broadcast hub over
//! Server-Sent Events.
//!
//! # Endpoints
//!
//! - `POST /connect` - Open the gateway session (`{host?, port?, client_id?}`)
//! - `POST /disconnect` - Tear the session down
//! - `POST /subscribe` - Replace the active subscription (`{symbol?}`)
//! - `GET /status` - Connection state, symbol and buffered point count
//! - `GET /history` - Full price and log history for a newly attached observer
//! - `GET /events` - Server-Sent Events, one message per session event
//! - `GET /health` - JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (gateway session connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::SessionController;
use crate::application::services::ConnectionManager;
use crate::domain::market_data::{
    ConnectionState, LogEntry, PricePoint, SessionEvent, TickEvent, normalize_symbol,
};
use crate::infrastructure::broadcast::{BroadcastStats, SharedBroadcastHub};
use crate::infrastructure::config::BridgeConfig;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Request / Response Types
// =============================================================================

/// Body of `POST /connect`. Missing fields use the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectRequest {
    /// Gateway host.
    pub host: Option<String>,
    /// Gateway port.
    pub port: Option<u16>,
    /// API client identifier.
    pub client_id: Option<i32>,
}

/// Body of `POST /subscribe`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribeRequest {
    /// Symbol to subscribe to; the configured default when absent.
    pub symbol: Option<String>,
}

/// Result of a connect or disconnect command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Whether the command succeeded.
    pub success: bool,
    /// Whether the session is connected afterwards.
    pub connected: bool,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a subscribe command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// Whether the subscription was requested.
    pub success: bool,
    /// Normalized symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the session is connected.
    pub connected: bool,
    /// Full connection state.
    pub state: ConnectionState,
    /// Active subscription symbol.
    pub symbol: Option<String>,
    /// Buffered price points.
    pub data_points: usize,
}

/// Response of `GET /history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Active subscription symbol.
    pub symbol: Option<String>,
    /// Most recent price tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<TickEvent>,
    /// Price history, oldest first.
    pub prices: Vec<PricePoint>,
    /// Log history, oldest first.
    pub logs: Vec<LogEntry>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Gateway session.
    pub session: SessionHealth,
    /// Observer fan-out statistics.
    pub observers: BroadcastStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Gateway session connected.
    Healthy,
    /// Serving, but no gateway session.
    Degraded,
}

/// Gateway session health.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    /// Session identifier.
    pub session_id: Uuid,
    /// Connection state.
    pub state: ConnectionState,
    /// Active subscription symbol.
    pub symbol: Option<String>,
    /// Buffered price points.
    pub buffered_points: usize,
}

// =============================================================================
// Server State
// =============================================================================

/// Values used when a command omits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDefaults {
    /// Gateway host.
    pub host: String,
    /// Gateway port.
    pub port: u16,
    /// API client identifier.
    pub client_id: i32,
    /// Symbol for `POST /subscribe` without one.
    pub symbol: String,
}

impl Default for ControlDefaults {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

impl ControlDefaults {
    /// Defaults taken from the bridge configuration.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            host: config.gateway.host.clone(),
            port: config.gateway.port,
            client_id: config.gateway.client_id,
            symbol: config.session.default_symbol.clone(),
        }
    }
}

/// Shared state for the control server.
pub struct ControlState {
    version: String,
    started_at: Instant,
    session: ConnectionManager,
    hub: SharedBroadcastHub,
    defaults: ControlDefaults,
}

impl ControlState {
    /// Create new control server state.
    #[must_use]
    pub fn new(
        version: String,
        session: ConnectionManager,
        hub: SharedBroadcastHub,
        defaults: ControlDefaults,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            session,
            hub,
            defaults,
        }
    }
}

/// Build the control router.
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/connect", post(connect_handler))
        .route("/disconnect", post(disconnect_handler))
        .route("/subscribe", post(subscribe_handler))
        .route("/status", get(status_handler))
        .route("/history", get(history_handler))
        .route("/events", get(events_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// Control Server
// =============================================================================

/// Control API HTTP server.
pub struct ControlServer {
    port: u16,
    state: Arc<ControlState>,
    cancel: CancellationToken,
}

impl ControlServer {
    /// Create a new control server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<ControlState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the control server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ControlServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), ControlServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ControlServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Control server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ControlServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Control server stopped");
        Ok(())
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn connect_handler(
    State(state): State<Arc<ControlState>>,
    body: Option<Json<ConnectRequest>>,
) -> Json<ConnectResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let host = request.host.unwrap_or_else(|| state.defaults.host.clone());
    let port = request.port.unwrap_or(state.defaults.port);
    let client_id = request.client_id.unwrap_or(state.defaults.client_id);

    let result = state.session.connect(&host, port, client_id).await;
    let connected = state.session.state().is_connected();

    Json(match result {
        Ok(()) => ConnectResponse {
            success: true,
            connected,
            error: None,
        },
        Err(e) => ConnectResponse {
            success: false,
            connected,
            error: Some(e.to_string()),
        },
    })
}

async fn disconnect_handler(State(state): State<Arc<ControlState>>) -> Json<ConnectResponse> {
    state.session.disconnect().await;
    Json(ConnectResponse {
        success: true,
        connected: state.session.state().is_connected(),
        error: None,
    })
}

async fn subscribe_handler(
    State(state): State<Arc<ControlState>>,
    body: Option<Json<SubscribeRequest>>,
) -> Json<SubscribeResponse> {
    let requested = body
        .and_then(|Json(r)| r.symbol)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| state.defaults.symbol.clone());

    Json(match state.session.subscribe(&requested).await {
        Ok(_) => SubscribeResponse {
            success: true,
            symbol: normalize_symbol(&requested),
            error: None,
        },
        Err(e) => SubscribeResponse {
            success: false,
            symbol: None,
            error: Some(e.to_string()),
        },
    })
}

// =============================================================================
// Query Handlers
// =============================================================================

async fn status_handler(State(state): State<Arc<ControlState>>) -> Json<StatusResponse> {
    let status = state.session.status();
    Json(StatusResponse {
        connected: status.connected,
        state: status.state,
        symbol: status.symbol,
        data_points: status.buffered_points,
    })
}

async fn history_handler(State(state): State<Arc<ControlState>>) -> Json<HistoryResponse> {
    let session = &state.session;
    Json(HistoryResponse {
        symbol: session.status().symbol,
        latest: session.latest_price(),
        prices: session
            .price_history()
            .iter()
            .filter_map(TickEvent::to_point)
            .collect(),
        logs: session.log_history(),
    })
}

async fn events_handler(
    State(state): State<Arc<ControlState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.hub.subscribe();
    tracing::debug!(
        receivers = state.hub.receiver_count(),
        "Observer attached"
    );

    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => sse_event(&event).map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "Observer lagged, dropped oldest events");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Render a session event as one SSE message carrying the bare payload.
fn sse_event(event: &SessionEvent) -> Option<Event> {
    let payload = match serde_json::to_value(event) {
        Ok(mut value) => value.get_mut("data").map(serde_json::Value::take)?,
        Err(e) => {
            tracing::error!(error = %e, event = event.name(), "Failed to encode session event");
            return None;
        }
    };

    Some(Event::default().event(event.name()).data(payload.to_string()))
}

// =============================================================================
// Health Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(build_health_response(&state)))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    if state.session.state().is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &ControlState) -> HealthResponse {
    let status = state.session.status();
    let health = if status.connected {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    HealthResponse {
        status: health,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        session: SessionHealth {
            session_id: state.session.session_id(),
            state: status.state,
            symbol: status.symbol,
            buffered_points: status.buffered_points,
        },
        observers: state.hub.stats(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Control server errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::EventPublisher;
    use crate::application::services::SessionConfig;
    use crate::domain::market_data::LinkStatus;
    use crate::infrastructure::broadcast::BroadcastHub;
    use crate::infrastructure::gateway::{SimulatedGateway, SimulatorConfig};

    fn control_state() -> (Arc<ControlState>, SharedBroadcastHub) {
        let hub = Arc::new(BroadcastHub::with_defaults());
        let gateway = Arc::new(SimulatedGateway::new(SimulatorConfig {
            stream_ticks: false,
            ..SimulatorConfig::default()
        }));
        let session = ConnectionManager::new(gateway, hub.clone(), SessionConfig::default());
        let state = Arc::new(ControlState::new(
            "test".to_string(),
            session,
            Arc::clone(&hub),
            ControlDefaults::default(),
        ));
        (state, hub)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn post_json(uri: &str, json: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn connect_without_body_uses_defaults() {
        let (state, _hub) = control_state();
        let app = router(state);

        let (status, body) = send(&app, Request::post("/connect").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);

        let response: ConnectResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            response,
            ConnectResponse {
                success: true,
                connected: true,
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn second_connect_reports_failure() {
        let (state, _hub) = control_state();
        let app = router(state);

        send(&app, post_json("/connect", "{}")).await;
        let (_, body) = send(&app, post_json("/connect", r#"{"port":4001}"#)).await;

        let response: ConnectResponse = serde_json::from_slice(&body).unwrap();
        assert!(!response.success);
        assert!(response.connected);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn subscribe_normalizes_symbol() {
        let (state, _hub) = control_state();
        let app = router(state);

        send(&app, post_json("/connect", "{}")).await;
        let (_, body) = send(&app, post_json("/subscribe", r#"{"symbol":" msft "}"#)).await;

        let response: SubscribeResponse = serde_json::from_slice(&body).unwrap();
        assert!(response.success);
        assert_eq!(response.symbol.as_deref(), Some("MSFT"));

        let (_, body) = send(&app, get("/status")).await;
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert!(status.connected);
        assert_eq!(status.symbol.as_deref(), Some("MSFT"));
        assert_eq!(status.data_points, 0);
    }

    #[tokio::test]
    async fn subscribe_defaults_symbol() {
        let (state, _hub) = control_state();
        let app = router(state);

        send(&app, post_json("/connect", "{}")).await;
        let (_, body) = send(&app, post_json("/subscribe", "{}")).await;

        let response: SubscribeResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.symbol.as_deref(), Some("AAPL"));
    }

    #[tokio::test]
    async fn subscribe_while_disconnected_fails() {
        let (state, _hub) = control_state();
        let app = router(state);

        let (_, body) = send(&app, post_json("/subscribe", r#"{"symbol":"AAPL"}"#)).await;

        let response: SubscribeResponse = serde_json::from_slice(&body).unwrap();
        assert!(!response.success);
        assert!(response.symbol.is_none());
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn disconnect_reports_state() {
        let (state, _hub) = control_state();
        let app = router(state);

        send(&app, post_json("/connect", "{}")).await;
        let (_, body) = send(&app, Request::post("/disconnect").body(Body::empty()).unwrap()).await;

        let response: ConnectResponse = serde_json::from_slice(&body).unwrap();
        assert!(response.success);
        assert!(!response.connected);
    }

    #[tokio::test]
    async fn history_contains_logs() {
        let (state, _hub) = control_state();
        let app = router(state);

        send(&app, post_json("/connect", "{}")).await;
        let (status, body) = send(&app, get("/history")).await;
        assert_eq!(status, StatusCode::OK);

        let history: HistoryResponse = serde_json::from_slice(&body).unwrap();
        assert!(history.prices.is_empty());
        assert!(history.latest.is_none());
        assert!(
            history
                .logs
                .iter()
                .any(|entry| entry.message == "Connected to gateway")
        );
    }

    #[tokio::test]
    async fn readiness_follows_connection() {
        let (state, _hub) = control_state();
        let app = router(state);

        let (status, _) = send(&app, get("/readyz")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        send(&app, post_json("/connect", "{}")).await;
        let (status, _) = send(&app, get("/readyz")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_session() {
        let (state, _hub) = control_state();
        let session_id = state.session.session_id();
        let app = router(state);

        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["session"]["state"], "disconnected");
        assert_eq!(json["session"]["session_id"], session_id.to_string());
        assert_eq!(json["version"], "test");
    }

    #[tokio::test]
    async fn events_stream_carries_named_payloads() {
        let (state, hub) = control_state();
        let app = router(state);

        let response = app.oneshot(get("/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hub.receiver_count(), 1);

        hub.publish(SessionEvent::ConnectionStatus {
            status: LinkStatus::Connected,
        });

        let mut frames = response.into_body().into_data_stream();
        let frame = tokio::time::timeout(Duration::from_secs(1), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();

        assert!(text.contains("event: connection_status"));
        assert!(text.contains(r#"data: {"status":"connected"}"#));
    }
}
