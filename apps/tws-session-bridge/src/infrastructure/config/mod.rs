//! Configuration Module
//!
//! Configuration loading for the session bridge.

mod settings;

pub use settings::{
    BridgeConfig, BroadcastSettings, ConfigError, GatewayMode, GatewaySettings, ServerSettings,
    SessionSettings, SimulatorSettings,
};
