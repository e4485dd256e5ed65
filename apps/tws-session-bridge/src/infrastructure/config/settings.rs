//! Bridge Configuration Settings
//!
//! Configuration types for the session bridge, loaded from environment
//! variables. Every value has a default; unparsable values fall back to it.

use std::time::Duration;

use crate::application::services::{DispatcherConfig, SessionConfig};
use crate::domain::market_data::{ContractSpec, RequestId, normalize_symbol};

/// Which gateway client the bridge talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayMode {
    /// In-process simulated gateway.
    #[default]
    Simulated,
    /// JSON-over-WebSocket gateway bridge.
    Bridge,
}

impl GatewayMode {
    /// Parse mode from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "bridge" => Self::Bridge,
            _ => Self::Simulated,
        }
    }

    /// Get the mode name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Bridge => "bridge",
        }
    }
}

/// Gateway endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Gateway host.
    pub host: String,
    /// Gateway port.
    pub port: u16,
    /// API client identifier.
    pub client_id: i32,
    /// Gateway client implementation.
    pub mode: GatewayMode,
    /// WebSocket path of the gateway bridge.
    pub bridge_path: String,
    /// Heartbeat ping interval on the bridge socket.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before the bridge socket is considered dead.
    pub heartbeat_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4002,
            client_id: 1,
            mode: GatewayMode::default(),
            bridge_path: "/gateway".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Session behaviour settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Handshake timeout for `connect`.
    pub connect_timeout: Duration,
    /// Price history capacity.
    pub price_capacity: usize,
    /// Log history capacity.
    pub log_capacity: usize,
    /// Points carried in each `price_update`.
    pub price_window: usize,
    /// Request identifier used before the gateway announces its own.
    pub initial_request_id: RequestId,
    /// Chart Bid and Ask as well as Last.
    pub observe_quotes: bool,
    /// Journal every observable price tick.
    pub log_ticks: bool,
    /// Symbol used when a subscribe request names none.
    pub default_symbol: String,
    /// Contract exchange.
    pub exchange: String,
    /// Contract currency.
    pub currency: String,
    /// Contract security type.
    pub security_type: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            price_capacity: 500,
            log_capacity: 100,
            price_window: 50,
            initial_request_id: 1,
            observe_quotes: false,
            log_ticks: false,
            default_symbol: "AAPL".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            security_type: "STK".to_string(),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Control API, health and metrics HTTP port.
    pub control_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { control_port: 8000 }
    }
}

/// Broadcast channel settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Per-observer event queue capacity.
    pub capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Simulated gateway settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorSettings {
    /// Interval between simulated ticks.
    pub tick_interval: Duration,
    /// Starting price of the random walk.
    pub start_price: f64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            start_price: 100.0,
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Gateway endpoint settings.
    pub gateway: GatewaySettings,
    /// Session behaviour settings.
    pub session: SessionSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Broadcast channel settings.
    pub broadcast: BroadcastSettings,
    /// Simulated gateway settings.
    pub simulator: SimulatorSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            session: SessionSettings::default(),
            server: ServerSettings::default(),
            broadcast: BroadcastSettings::default(),
            simulator: SimulatorSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable (empty host,
    /// zero capacity, blank default symbol).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let defaults = Self::default();

        let host = env.string("TWS_HOST", &defaults.gateway.host);
        if host.trim().is_empty() {
            return Err(ConfigError::EmptyValue("TWS_HOST".to_string()));
        }

        let gateway = GatewaySettings {
            host,
            port: env.parse("TWS_PORT", defaults.gateway.port),
            client_id: env.parse("TWS_CLIENT_ID", defaults.gateway.client_id),
            mode: env
                .get("TWS_GATEWAY_MODE")
                .map(|s| GatewayMode::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            bridge_path: env.string("TWS_BRIDGE_PATH", &defaults.gateway.bridge_path),
            heartbeat_interval: env.duration_secs(
                "TWS_BRIDGE_HEARTBEAT_INTERVAL_SECS",
                defaults.gateway.heartbeat_interval,
            ),
            heartbeat_timeout: env.duration_secs(
                "TWS_BRIDGE_HEARTBEAT_TIMEOUT_SECS",
                defaults.gateway.heartbeat_timeout,
            ),
        };

        let default_symbol = env.string("SESSION_DEFAULT_SYMBOL", &defaults.session.default_symbol);
        let default_symbol = normalize_symbol(&default_symbol)
            .ok_or_else(|| ConfigError::EmptyValue("SESSION_DEFAULT_SYMBOL".to_string()))?;

        let session = SessionSettings {
            connect_timeout: env.duration_millis(
                "SESSION_CONNECT_TIMEOUT_MS",
                defaults.session.connect_timeout,
            ),
            price_capacity: env.capacity("SESSION_PRICE_CAPACITY", defaults.session.price_capacity)?,
            log_capacity: env.capacity("SESSION_LOG_CAPACITY", defaults.session.log_capacity)?,
            price_window: env.capacity("SESSION_PRICE_WINDOW", defaults.session.price_window)?,
            initial_request_id: env.parse(
                "SESSION_INITIAL_REQUEST_ID",
                defaults.session.initial_request_id,
            ),
            observe_quotes: env.flag("SESSION_OBSERVE_QUOTES", defaults.session.observe_quotes),
            log_ticks: env.flag("SESSION_LOG_TICKS", defaults.session.log_ticks),
            default_symbol,
            exchange: env.string("SESSION_EXCHANGE", &defaults.session.exchange),
            currency: env.string("SESSION_CURRENCY", &defaults.session.currency),
            security_type: env.string("SESSION_SECURITY_TYPE", &defaults.session.security_type),
        };

        let server = ServerSettings {
            control_port: env.parse("CONTROL_PORT", defaults.server.control_port),
        };

        let broadcast = BroadcastSettings {
            capacity: env.capacity("BROADCAST_CAPACITY", defaults.broadcast.capacity)?,
        };

        let simulator = SimulatorSettings {
            tick_interval: env.duration_millis(
                "SIM_TICK_INTERVAL_MS",
                defaults.simulator.tick_interval,
            ),
            start_price: env.parse("SIM_START_PRICE", defaults.simulator.start_price),
        };

        Ok(Self {
            gateway,
            session,
            server,
            broadcast,
            simulator,
        })
    }

    /// Session configuration derived from these settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.session.connect_timeout,
            log_capacity: self.session.log_capacity,
            dispatcher: DispatcherConfig {
                price_capacity: self.session.price_capacity,
                price_window: self.session.price_window,
                observe_quotes: self.session.observe_quotes,
                log_ticks: self.session.log_ticks,
            },
            initial_request_id: self.session.initial_request_id,
            contract: ContractSpec {
                symbol: String::new(),
                security_type: self.session.security_type.clone(),
                exchange: self.session.exchange.clone(),
                currency: self.session.currency.clone(),
            },
        }
    }

    /// WebSocket URL of the gateway bridge.
    #[must_use]
    pub fn bridge_url(&self) -> String {
        format!(
            "ws://{}:{}{}",
            self.gateway.host, self.gateway.port, self.gateway.bridge_path
        )
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key).map_or(default, |v| {
            matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    fn capacity(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.parse(key, default) {
            0 => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: "capacity must be at least 1".to_string(),
            }),
            n => Ok(n),
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
