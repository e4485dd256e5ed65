//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `GatewayClient`: Commands sent to the market data gateway
//! - `EventPublisher`: Fan-out of session events to observers
//!
//! ## Driver Ports (Inbound)
//!
//! - `SessionController`: Control surface used by front ends
//! - `GatewayEventSink`: Callbacks delivered by the gateway read loop

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::market_data::{ContractSpec, RequestId, SessionEvent};
use crate::domain::subscription::SubscriptionError;

// =============================================================================
// Gateway Messages
// =============================================================================

/// Inbound callback delivered by the gateway on its message stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMessage {
    /// Handshake acknowledged.
    ConnectAck,
    /// The session was closed by the gateway or the transport.
    ConnectionClosed,
    /// Error notice, optionally tied to a request.
    Error {
        /// Request the error refers to (`-1` for session-level notices).
        request_id: RequestId,
        /// Gateway error code.
        code: i32,
        /// Error text.
        text: String,
    },
    /// Price tick.
    TickPrice {
        /// Request the tick belongs to.
        request_id: RequestId,
        /// Raw tick code.
        tick_type: i32,
        /// Price.
        price: f64,
    },
    /// Size tick.
    TickSize {
        /// Request the tick belongs to.
        request_id: RequestId,
        /// Raw tick code.
        tick_type: i32,
        /// Size.
        size: i64,
    },
    /// Lowest request identifier the gateway accepts.
    NextValidId(RequestId),
}

/// Stream of inbound gateway messages for one session.
pub type GatewayStream = mpsc::Receiver<GatewayMessage>;

// =============================================================================
// Gateway Client Port
// =============================================================================

/// Errors raised by gateway client adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Opening the session failed.
    #[error("failed to open gateway session at {address}: {reason}")]
    ConnectFailed {
        /// Gateway address.
        address: String,
        /// Failure description.
        reason: String,
    },

    /// No session is open.
    #[error("gateway session is not open")]
    NotConnected,

    /// Sending a command failed.
    #[error("failed to send gateway command: {0}")]
    SendFailed(String),

    /// A frame could not be encoded or decoded.
    #[error("gateway codec error: {0}")]
    Codec(String),

    /// The WebSocket transport failed.
    #[error("gateway websocket error: {0}")]
    WebSocket(String),
}

/// Session-fatal gateway error codes.
///
/// 502: cannot connect, 504: not connected, 507: bad message length,
/// 1300: socket port reset.
pub const FATAL_ERROR_CODES: [i32; 4] = [502, 504, 507, 1300];

/// Code the gateway client reports for frames it could not encode or decode.
///
/// Not a gateway code; never session-fatal.
pub const PROTOCOL_ERROR_CODE: i32 = 0;

/// Error notice delivered by the gateway `error` callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Error {code}: {text}")]
pub struct GatewayError {
    /// Request the error refers to (`-1` for session-level notices).
    pub request_id: RequestId,
    /// Gateway error code.
    pub code: i32,
    /// Error text.
    pub text: String,
}

impl GatewayError {
    /// Create a gateway error.
    #[must_use]
    pub fn new(request_id: RequestId, code: i32, text: impl Into<String>) -> Self {
        Self {
            request_id,
            code,
            text: text.into(),
        }
    }

    /// Whether this error means the session itself died.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        FATAL_ERROR_CODES.contains(&self.code)
    }

    /// Whether this is a data-farm status notice rather than a failure.
    #[must_use]
    pub const fn is_informational(&self) -> bool {
        matches!(self.code, 2100..=2199)
    }

    /// Whether the gateway client raised this for a bad frame.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        self.code == PROTOCOL_ERROR_CODE
    }

    /// Metric label for the code class.
    #[must_use]
    pub fn class(&self) -> &'static str {
        if self.is_session_fatal() {
            "fatal"
        } else if self.is_protocol() {
            "protocol"
        } else if self.is_informational() {
            "notice"
        } else {
            "request"
        }
    }
}

/// Port for issuing commands to the market data gateway.
///
/// `open_session` returns the inbound message stream; everything the gateway
/// says afterwards, including the handshake acknowledgment, arrives on it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Open a session and return its inbound message stream.
    async fn open_session(
        &self,
        host: &str,
        port: u16,
        client_id: i32,
    ) -> Result<GatewayStream, TransportError>;

    /// Close the current session.
    async fn close_session(&self) -> Result<(), TransportError>;

    /// Request streaming market data for a contract.
    async fn request_market_data(
        &self,
        request_id: RequestId,
        contract: &ContractSpec,
    ) -> Result<(), TransportError>;

    /// Cancel a streaming market data request.
    async fn cancel_market_data(&self, request_id: RequestId) -> Result<(), TransportError>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing session events to observers.
///
/// Implementations must not block: the read loop publishes on every tick.
pub trait EventPublisher: Send + Sync {
    /// Publish an event. Returns the number of observers reached.
    fn publish(&self, event: SessionEvent) -> usize;
}

// =============================================================================
// Session Capabilities
// =============================================================================

/// Errors returned by `connect`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// A session is already open or being opened.
    #[error("session already active (state: {0})")]
    AlreadyActive(String),

    /// The gateway did not acknowledge the handshake in time.
    #[error("handshake not acknowledged within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// The handshake was aborted by a disconnect or a session failure.
    #[error("connection attempt aborted")]
    Aborted,

    /// The gateway client failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Snapshot of the session for front ends.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionStatus {
    /// Whether the session is connected.
    pub connected: bool,
    /// Full connection state.
    pub state: crate::domain::market_data::ConnectionState,
    /// Active subscription symbol.
    pub symbol: Option<String>,
    /// Number of buffered price points.
    pub buffered_points: usize,
}

/// Commands a front end issues against a session.
#[async_trait]
pub trait SessionController: Send + Sync {
    /// Open the gateway session and wait for the handshake.
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<(), ConnectionError>;

    /// Tear the session down. No-op unless connected or connecting.
    async fn disconnect(&self);

    /// Replace the active subscription with `symbol`.
    async fn subscribe(&self, symbol: &str) -> Result<RequestId, SubscriptionError>;

    /// Current session status.
    fn status(&self) -> SessionStatus;
}

/// Callbacks the gateway read loop delivers to the session.
pub trait GatewayEventSink: Send + Sync {
    /// Handshake acknowledged.
    fn connect_ack(&self);

    /// Session closed by the gateway.
    fn connection_closed(&self);

    /// Error notice. Returns `true` if the session died.
    fn error(&self, request_id: RequestId, code: i32, text: &str) -> bool;

    /// Price tick.
    fn tick_price(&self, request_id: RequestId, tick_type: i32, price: f64);

    /// Size tick.
    fn tick_size(&self, request_id: RequestId, tick_type: i32, size: i64);

    /// Lowest accepted request identifier.
    fn next_valid_id(&self, request_id: RequestId);
}
