//! Market Data Types
//!
//! Core domain types for the gateway session: connection state, ticks,
//! log entries, contract specs and the events published to observers.
//! These types carry no resources and are immutable once built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier correlating a market data request with its tick callbacks.
pub type RequestId = i64;

/// Display format used for the short `timestamp` field in published events.
pub const CLOCK_FORMAT: &str = "%H:%M:%S";

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the single gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session open.
    #[default]
    Disconnected,
    /// Session opened, waiting for the handshake acknowledgment.
    Connecting,
    /// Handshake acknowledged.
    Connected,
    /// Teardown requested, waiting for the session to close.
    Disconnecting,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }

    /// Check if the session is connected.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Ticks
// =============================================================================

/// Kind of a tick the session understands.
///
/// Gateway tick codes follow the TWS numbering. Delayed-data codes map onto
/// the same kinds as their real-time counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickKind {
    /// Last traded price.
    Last,
    /// Best bid price.
    Bid,
    /// Best ask price.
    Ask,
    /// Cumulative day volume.
    Volume,
}

impl TickKind {
    /// Map a gateway tick code to a kind. Unknown codes yield `None`.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 | 66 => Some(Self::Bid),
            2 | 67 => Some(Self::Ask),
            4 | 68 => Some(Self::Last),
            8 | 74 => Some(Self::Volume),
            _ => None,
        }
    }

    /// Real-time gateway code for this kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Bid => 1,
            Self::Ask => 2,
            Self::Last => 4,
            Self::Volume => 8,
        }
    }

    /// Get the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Last => "last",
            Self::Bid => "bid",
            Self::Ask => "ask",
            Self::Volume => "volume",
        }
    }

    /// Whether this kind carries a price (as opposed to a size).
    #[must_use]
    pub const fn is_price(self) -> bool {
        matches!(self, Self::Last | Self::Bid | Self::Ask)
    }
}

/// Value carried by a tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TickValue {
    /// A price.
    Price(f64),
    /// A size or volume.
    Size(i64),
}

/// One observed tick for the subscribed instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickEvent {
    /// Time the tick was dispatched.
    pub timestamp: DateTime<Utc>,
    /// Subscribed symbol.
    pub symbol: String,
    /// Tick kind.
    pub kind: TickKind,
    /// Tick value.
    pub value: TickValue,
}

impl TickEvent {
    /// Create a price tick.
    #[must_use]
    pub fn price(timestamp: DateTime<Utc>, symbol: &str, kind: TickKind, price: f64) -> Self {
        Self {
            timestamp,
            symbol: symbol.to_string(),
            kind,
            value: TickValue::Price(price),
        }
    }

    /// Price carried by this tick, if any.
    #[must_use]
    pub const fn price_value(&self) -> Option<f64> {
        match self.value {
            TickValue::Price(p) => Some(p),
            TickValue::Size(_) => None,
        }
    }

    /// Chart point for this tick. Size ticks have no chart point.
    #[must_use]
    pub fn to_point(&self) -> Option<PricePoint> {
        self.price_value().map(|price| PricePoint::new(self.timestamp, price))
    }
}

/// A `{timestamp, price}` point used in published price windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Short clock form (`HH:MM:SS`).
    pub timestamp: String,
    /// Price.
    pub price: f64,
    /// Full RFC 3339 timestamp.
    pub datetime: DateTime<Utc>,
}

impl PricePoint {
    /// Create a point from a timestamp and price.
    #[must_use]
    pub fn new(at: DateTime<Utc>, price: f64) -> Self {
        Self {
            timestamp: at.format(CLOCK_FORMAT).to_string(),
            price,
            datetime: at,
        }
    }
}

// =============================================================================
// Log Entries
// =============================================================================

/// Severity of a user-facing log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Informational.
    Info,
    /// Error.
    Error,
}

/// A user-facing log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Short clock form (`HH:MM:SS`).
    pub timestamp: String,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Full RFC 3339 timestamp.
    pub datetime: DateTime<Utc>,
}

impl LogEntry {
    /// Create an entry recorded at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: at.format(CLOCK_FORMAT).to_string(),
            level,
            message: message.into(),
            datetime: at,
        }
    }

    /// Create an entry stamped now.
    #[must_use]
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(Utc::now(), level, message)
    }
}

// =============================================================================
// Contracts and Subscriptions
// =============================================================================

/// Instrument description sent with a market data request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Ticker symbol.
    pub symbol: String,
    /// Security type (e.g. `STK`).
    pub security_type: String,
    /// Routing exchange (e.g. `SMART`).
    pub exchange: String,
    /// Currency (e.g. `USD`).
    pub currency: String,
}

impl ContractSpec {
    /// US stock routed through SMART.
    #[must_use]
    pub fn stock(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            security_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
        }
    }
}

/// The single active market data subscription of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Request identifier the gateway tags ticks with.
    pub request_id: RequestId,
    /// Requested contract.
    pub contract: ContractSpec,
}

impl Subscription {
    /// Subscribed symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.contract.symbol
    }
}

/// Normalize a user-supplied symbol. Returns `None` for blank input.
#[must_use]
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

// =============================================================================
// Published Events
// =============================================================================

/// Connection status carried by `connection_status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// Session connected.
    Connected,
    /// Session disconnected.
    Disconnected,
}

/// Payload of a `price_update` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Subscribed symbol.
    pub symbol: String,
    /// Tick kind that produced the update.
    pub kind: TickKind,
    /// New price.
    pub price: f64,
    /// Short clock form of the tick time.
    pub timestamp: String,
    /// Most recent buffered points, oldest first.
    pub recent_window: Vec<PricePoint>,
}

/// Events published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new observable price.
    PriceUpdate(PriceUpdate),
    /// A new log entry.
    LogUpdate(LogEntry),
    /// Connection status changed.
    ConnectionStatus {
        /// New status.
        status: LinkStatus,
    },
}

impl SessionEvent {
    /// Event name used by observers.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PriceUpdate(_) => "price_update",
            Self::LogUpdate(_) => "log_update",
            Self::ConnectionStatus { .. } => "connection_status",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
