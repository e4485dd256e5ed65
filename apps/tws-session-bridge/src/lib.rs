#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::redundant_clone
    )
)]

//! TWS Session Bridge - Market Data Session and Event Fan-out
//!
//! Maintains one session to a real-time market data gateway, subscribes to a
//! single instrument at a time, turns the gateway's callback stream into
//! typed events, and fans them out to any number of observers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure session types
//!   - `market_data`: Connection state, ticks, log entries, events
//!   - `buffer`: Bounded drop-oldest history
//!   - `subscription`: Request ids and the single subscription slot
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Gateway client, event publisher, session capabilities
//!   - `services`: Connection manager, subscription registry, tick dispatch,
//!     event journal
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `gateway`: Bridge WebSocket client and in-process simulator
//!   - `broadcast`: Channel-based event fan-out
//!   - `http`: Control API, SSE event stream, health and metrics
//!   - `config`: Environment configuration
//!
//! # Data Flow
//!
//! ```text
//!             commands                        callbacks
//! HTTP ──────────────────► ConnectionManager ◄────────── read loop ◄── Gateway
//!                               │                            │
//!                               ▼                            ▼
//!                         EventJournal               TickDispatcher
//!                               │                            │
//!                               └──────► BroadcastHub ◄──────┘
//!                                            │
//!                                   SSE observers 1..N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core session types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::buffer::BoundedEventBuffer;
pub use domain::market_data::{
    ConnectionState, ContractSpec, LinkStatus, LogEntry, LogLevel, PricePoint, PriceUpdate,
    RequestId, SessionEvent, TickEvent, TickKind, TickValue,
};
pub use domain::subscription::{RequestIdAllocator, SubscriptionError};

// Ports
pub use application::ports::{
    ConnectionError, EventPublisher, GatewayClient, GatewayError, GatewayEventSink,
    GatewayMessage, PROTOCOL_ERROR_CODE, SessionController, SessionStatus, TransportError,
};

// Services
pub use application::services::{
    ConnectionManager, DispatcherConfig, EventJournal, SessionConfig, SubscriptionRegistry,
    TickDispatcher,
};

// Infrastructure config
pub use infrastructure::config::{BridgeConfig, ConfigError, GatewayMode};

// Gateway adapters (for integration tests)
pub use infrastructure::gateway::{
    BridgeGateway, BridgeGatewayConfig, GatewayCall, SimulatedGateway, SimulatorConfig,
};

// Broadcast hub
pub use infrastructure::broadcast::{BroadcastHub, BroadcastStats, SharedBroadcastHub};

// Control server
pub use infrastructure::http::{ControlDefaults, ControlServer, ControlServerError, ControlState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
