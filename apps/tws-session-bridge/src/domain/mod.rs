//! Domain Layer - Core session types and business logic.
//!
//! This layer contains the core domain types for the market data session
//! with no I/O. All types here are pure Rust with serialization support.

/// Bounded drop-oldest event buffer.
pub mod buffer;

/// Market data types (ticks, log entries, connection state, events).
pub mod market_data;

/// Subscription tracking and request id allocation.
pub mod subscription;
