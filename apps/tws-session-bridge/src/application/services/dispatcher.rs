//! Tick Dispatcher
//!
//! Classifies raw tick callbacks into domain events and decides which of them
//! observers get to see.
//!
//! # Design
//!
//! Price ticks of an observable kind go through a fixed sequence: the dispatch
//! time is captured, a [`TickEvent`] is built and pushed into the price
//! history, and a `price_update` carrying the most recent window of points is
//! published. Volume ticks become a journal entry only. Unknown tick codes are
//! not errors and are dropped without a log entry.

use std::sync::Arc;

use chrono::Utc;

use crate::application::ports::EventPublisher;
use crate::application::services::EventJournal;
use crate::domain::buffer::{BoundedEventBuffer, DEFAULT_PRICE_CAPACITY};
use crate::domain::market_data::{
    CLOCK_FORMAT, PricePoint, PriceUpdate, SessionEvent, TickEvent, TickKind,
};
use crate::infrastructure::metrics;

/// Default number of points carried in each `price_update`.
pub const DEFAULT_PRICE_WINDOW: usize = 50;

/// Configuration for the tick dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Capacity of the price history.
    pub price_capacity: usize,
    /// Points carried in each `price_update`.
    pub price_window: usize,
    /// Also chart Bid and Ask ticks, not only Last.
    pub observe_quotes: bool,
    /// Write a journal entry for every observable price tick.
    pub log_ticks: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            price_capacity: DEFAULT_PRICE_CAPACITY,
            price_window: DEFAULT_PRICE_WINDOW,
            observe_quotes: false,
            log_ticks: false,
        }
    }
}

/// What the dispatcher did with a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Buffered and published as a `price_update`.
    Published,
    /// Recorded as a journal entry only.
    Journaled,
    /// Discarded because the value was out of range.
    Rejected,
    /// Not an observable kind.
    Ignored,
}

/// Turns raw tick callbacks into buffered, published domain events.
pub struct TickDispatcher {
    prices: BoundedEventBuffer<TickEvent>,
    journal: Arc<EventJournal>,
    publisher: Arc<dyn EventPublisher>,
    config: DispatcherConfig,
}

impl std::fmt::Debug for TickDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickDispatcher")
            .field("buffered", &self.prices.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TickDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        journal: Arc<EventJournal>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            prices: BoundedEventBuffer::new(config.price_capacity),
            journal,
            publisher,
            config,
        }
    }

    /// Whether price ticks of `kind` are charted.
    #[must_use]
    pub const fn is_observable(&self, kind: TickKind) -> bool {
        match kind {
            TickKind::Last => true,
            TickKind::Bid | TickKind::Ask => self.config.observe_quotes,
            TickKind::Volume => false,
        }
    }

    /// Handle a `tickPrice` callback for the subscribed `symbol`.
    pub fn on_tick_price(&self, symbol: &str, tick_type: i32, price: f64) -> Dispatch {
        let kind = TickKind::from_code(tick_type);
        metrics::record_tick_received(kind);

        let Some(kind) = kind.filter(|k| k.is_price() && self.is_observable(*k)) else {
            tracing::trace!(symbol, tick_type, price, "Ignoring price tick");
            return Dispatch::Ignored;
        };

        if !price.is_finite() || price <= 0.0 {
            self.journal.error(format!(
                "Discarded {} price {price} for {symbol}",
                kind.as_str()
            ));
            return Dispatch::Rejected;
        }

        let at = Utc::now();
        let tick = TickEvent::price(at, symbol, kind, price);
        self.prices.push(tick);

        let recent_window: Vec<PricePoint> = self
            .prices
            .tail(self.config.price_window)
            .iter()
            .filter_map(TickEvent::to_point)
            .collect();

        let event = SessionEvent::PriceUpdate(PriceUpdate {
            symbol: symbol.to_string(),
            kind,
            price,
            timestamp: at.format(CLOCK_FORMAT).to_string(),
            recent_window,
        });
        let reached = self.publisher.publish(event);
        metrics::record_tick_dispatched(kind);
        metrics::record_event_published("price_update", reached);

        if self.config.log_ticks {
            self.journal
                .info(format!("Price update for {symbol}: ${price:.2}"));
        }

        Dispatch::Published
    }

    /// Handle a `tickSize` callback for the subscribed `symbol`.
    pub fn on_tick_size(&self, symbol: &str, tick_type: i32, size: i64) -> Dispatch {
        let kind = TickKind::from_code(tick_type);
        metrics::record_tick_received(kind);

        if kind == Some(TickKind::Volume) {
            self.journal.info(format!("Volume update: {size}"));
            Dispatch::Journaled
        } else {
            tracing::trace!(symbol, tick_type, size, "Ignoring size tick");
            Dispatch::Ignored
        }
    }

    /// Drop the price history.
    pub fn clear(&self) {
        self.prices.clear();
    }

    /// Copy of the price history, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TickEvent> {
        self.prices.snapshot()
    }

    /// Most recent buffered tick.
    #[must_use]
    pub fn latest(&self) -> Option<TickEvent> {
        self.prices.latest()
    }

    /// Number of buffered price ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// Whether the price history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}
