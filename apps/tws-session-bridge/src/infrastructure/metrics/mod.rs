//! Prometheus Metrics Module
//!
//! Exposes session metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ticks**: Ticks received from the gateway and dispatched to observers
//! - **Events**: Session events published and published without observers
//! - **Session**: Connection state, connect attempts and handshake latency
//! - **Errors**: Gateway error notices by code class
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the control server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::market_data::{ConnectionState, TickKind};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Tick counters
    describe_counter!(
        "tws_bridge_ticks_received_total",
        "Total ticks received from the gateway by kind"
    );
    describe_counter!(
        "tws_bridge_ticks_dispatched_total",
        "Total price ticks buffered and published"
    );

    // Event counters
    describe_counter!(
        "tws_bridge_events_published_total",
        "Total session events published to observers"
    );
    describe_counter!(
        "tws_bridge_events_unobserved_total",
        "Total session events published with no observer attached"
    );

    // Session
    describe_gauge!(
        "tws_bridge_connection_state",
        "Gateway session state (0=disconnected, 1=connecting, 2=connected, 3=disconnecting)"
    );
    describe_counter!(
        "tws_bridge_connect_attempts_total",
        "Total connect attempts by outcome"
    );
    describe_counter!(
        "tws_bridge_subscriptions_total",
        "Total market data subscriptions requested"
    );

    // Error counters
    describe_counter!(
        "tws_bridge_gateway_errors_total",
        "Total gateway error notices by code class"
    );

    // Latency histograms
    describe_histogram!(
        "tws_bridge_connect_handshake_seconds",
        "Time from opening the session to the handshake acknowledgment"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for connect outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Handshake acknowledged.
    Connected,
    /// Handshake not acknowledged in time.
    TimedOut,
    /// Aborted by a disconnect or a fatal error.
    Aborted,
    /// Rejected before any gateway call.
    Rejected,
    /// The gateway client failed to open the session.
    Failed,
}

impl ConnectOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

const fn state_value(state: ConnectionState) -> f64 {
    match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Disconnecting => 3.0,
    }
}

/// Record a tick received from the gateway. Unknown codes are labelled `other`.
pub fn record_tick_received(kind: Option<TickKind>) {
    counter!(
        "tws_bridge_ticks_received_total",
        "kind" => kind.map_or("other", TickKind::as_str)
    )
    .increment(1);
}

/// Record a price tick dispatched to observers.
pub fn record_tick_dispatched(kind: TickKind) {
    counter!(
        "tws_bridge_ticks_dispatched_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a published session event and how many observers it reached.
pub fn record_event_published(event: &'static str, receivers: usize) {
    counter!("tws_bridge_events_published_total", "event" => event).increment(1);
    if receivers == 0 {
        counter!("tws_bridge_events_unobserved_total", "event" => event).increment(1);
    }
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("tws_bridge_connection_state").set(state_value(state));
}

/// Record a connect attempt.
pub fn record_connect_attempt(outcome: ConnectOutcome) {
    counter!(
        "tws_bridge_connect_attempts_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a subscription request.
pub fn record_subscription() {
    counter!("tws_bridge_subscriptions_total").increment(1);
}

/// Record a gateway error notice.
pub fn record_gateway_error(class: &'static str) {
    counter!("tws_bridge_gateway_errors_total", "class" => class).increment(1);
}

/// Record the handshake latency of a successful connect.
pub fn record_handshake_duration(duration: Duration) {
    histogram!("tws_bridge_connect_handshake_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_outcome_as_str() {
        assert_eq!(ConnectOutcome::Connected.as_str(), "connected");
        assert_eq!(ConnectOutcome::TimedOut.as_str(), "timed_out");
        assert_eq!(ConnectOutcome::Aborted.as_str(), "aborted");
        assert_eq!(ConnectOutcome::Rejected.as_str(), "rejected");
        assert_eq!(ConnectOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn state_values_are_distinct() {
        assert!((state_value(ConnectionState::Disconnected) - 0.0).abs() < f64::EPSILON);
        assert!((state_value(ConnectionState::Connected) - 2.0).abs() < f64::EPSILON);
        assert!(state_value(ConnectionState::Connecting) < state_value(ConnectionState::Connected));
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_tick_received(Some(TickKind::Last));
        record_tick_received(None);
        record_event_published("price_update", 0);
        set_connection_state(ConnectionState::Connecting);
    }
}
