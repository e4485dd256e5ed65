//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the session interacts with the gateway and observers.

/// Port interfaces for external systems (gateway client, event sink).
pub mod ports;

/// Application services for the session, dispatch and subscriptions.
pub mod services;
