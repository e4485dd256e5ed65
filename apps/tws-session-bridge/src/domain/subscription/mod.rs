//! Subscription Tracking Types
//!
//! Domain types for the single active market data subscription of a session.
//!
//! # Design
//!
//! A session holds at most one subscription. Replacing it means detaching the
//! old record first, so ticks still in flight for the old request id are
//! recognised as stale and dropped, and only then requesting the new one.
//! Request ids come from a monotonic allocator and are never recycled.

mod request_id;

use parking_lot::Mutex;

pub use request_id::{DEFAULT_INITIAL_REQUEST_ID, RequestIdAllocator};

use super::market_data::{RequestId, Subscription};

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by subscription operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The session is not connected; no gateway call was made.
    #[error("not connected to gateway (state: {state})")]
    NotConnected {
        /// Session state at the time of the call.
        state: String,
    },

    /// The requested symbol was blank.
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Cancelling the previous request failed. Best effort only.
    #[error("failed to cancel market data request {request_id}: {reason}")]
    CancelFailed {
        /// Identifier of the request being cancelled.
        request_id: RequestId,
        /// Failure description.
        reason: String,
    },

    /// The gateway rejected or failed to send the new request.
    #[error("failed to request market data for {symbol}: {reason}")]
    RequestFailed {
        /// Requested symbol.
        symbol: String,
        /// Failure description.
        reason: String,
    },
}

// =============================================================================
// Subscription Slot
// =============================================================================

/// Thread-safe holder of the active subscription record.
///
/// The read loop routes each tick through [`SubscriptionSlot::route`], which
/// runs under the same lock that [`SubscriptionSlot::take`] needs. A record
/// that has been taken therefore never routes another tick.
#[derive(Debug, Default)]
pub struct SubscriptionSlot {
    active: Mutex<Option<Subscription>>,
}

impl SubscriptionSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a subscription, returning the one it replaced.
    pub fn replace(&self, subscription: Subscription) -> Option<Subscription> {
        self.active.lock().replace(subscription)
    }

    /// Remove the active subscription.
    pub fn take(&self) -> Option<Subscription> {
        self.active.lock().take()
    }

    /// Remove the active subscription only if it carries `request_id`.
    pub fn take_if(&self, request_id: RequestId) -> Option<Subscription> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|s| s.request_id == request_id) {
            active.take()
        } else {
            None
        }
    }

    /// Copy of the active subscription.
    #[must_use]
    pub fn current(&self) -> Option<Subscription> {
        self.active.lock().clone()
    }

    /// Run `f` with the active subscription if it matches `request_id`.
    ///
    /// Returns `None` without calling `f` for stale or unknown ids.
    pub fn route<R>(&self, request_id: RequestId, f: impl FnOnce(&Subscription) -> R) -> Option<R> {
        let active = self.active.lock();
        active
            .as_ref()
            .filter(|s| s.request_id == request_id)
            .map(f)
    }
}

// =============================================================================
// Tests
// =============================================================================
