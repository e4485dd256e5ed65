//! Broadcast Channel Adapter
//!
//! Implements the [`EventPublisher`] port using a tokio broadcast channel
//! for fan-out of session events to any number of observers.
//!
//! # Architecture
//!
//! Publishing never blocks. Each receiver has a bounded queue; a receiver
//! that falls behind loses its oldest events and is told how many it missed
//! on its next `recv`. A slow observer therefore never stalls the read loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::application::ports::EventPublisher;
use crate::domain::market_data::SessionEvent;

/// Default per-receiver queue capacity.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Central hub distributing session events to observers.
///
/// # Example
///
/// ```rust
/// use tws_session_bridge::application::ports::EventPublisher;
/// use tws_session_bridge::domain::market_data::{LinkStatus, SessionEvent};
/// use tws_session_bridge::infrastructure::broadcast::BroadcastHub;
///
/// let hub = BroadcastHub::new(16);
/// let mut rx = hub.subscribe();
///
/// let reached = hub.publish(SessionEvent::ConnectionStatus {
///     status: LinkStatus::Connected,
/// });
/// assert_eq!(reached, 1);
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Debug)]
pub struct BroadcastHub {
    tx: broadcast::Sender<SessionEvent>,
    published: AtomicU64,
    unobserved: AtomicU64,
}

impl BroadcastHub {
    /// Create a hub whose receivers buffer at most `capacity` events.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
            published: AtomicU64::new(0),
            unobserved: AtomicU64::new(0),
        }
    }

    /// Create a hub with the default capacity.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Get a new receiver for session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Get the number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get statistics about the hub.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            receivers: self.receiver_count(),
            published: self.published.load(Ordering::Relaxed),
            unobserved: self.unobserved.load(Ordering::Relaxed),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl EventPublisher for BroadcastHub {
    fn publish(&self, event: SessionEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // With no receivers, send returns Err; the event is simply unobserved.
        self.tx.send(event).unwrap_or_else(|_| {
            self.unobserved.fetch_add(1, Ordering::Relaxed);
            0
        })
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Statistics about the broadcast hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    /// Number of active receivers.
    pub receivers: usize,
    /// Total events published.
    pub published: u64,
    /// Events published while no receiver was attached.
    pub unobserved: u64,
}

// =============================================================================
// Tests
// =============================================================================
