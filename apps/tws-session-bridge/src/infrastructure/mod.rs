//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the process-level plumbing.

/// Broadcast channel adapter for event fan-out.
pub mod broadcast;

/// Configuration loaded from the environment.
pub mod config;

/// Gateway client adapters (bridge WebSocket, simulator).
pub mod gateway;

/// Control API, event stream and health endpoints.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing and OpenTelemetry integration.
pub mod telemetry;
