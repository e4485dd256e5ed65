//! TWS Session Bridge Binary
//!
//! Starts the gateway session manager and its control server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin tws-session-bridge
//! ```
//!
//! # Environment Variables
//!
//! - `TWS_GATEWAY_MODE`: simulated | bridge (default: simulated)
//! - `TWS_HOST` / `TWS_PORT` / `TWS_CLIENT_ID`: Gateway defaults for `POST /connect`
//! - `TWS_BRIDGE_PATH`: WebSocket path of the gateway bridge (default: /gateway)
//! - `CONTROL_PORT`: Control API, SSE, health and metrics port (default: 8000)
//! - `SESSION_*`: Session tuning, see `BridgeConfig`
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tws_session_bridge::application::ports::{GatewayClient, SessionController};
use tws_session_bridge::infrastructure::telemetry;
use tws_session_bridge::{
    BridgeConfig, BridgeGateway, BridgeGatewayConfig, BroadcastHub, ConnectionManager,
    ControlDefaults, ControlServer, ControlState, GatewayMode, SimulatedGateway, SimulatorConfig,
    init_metrics,
};

/// Time allowed for the gateway session to close on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting TWS session bridge");

    let _metrics_handle = init_metrics().context("failed to install Prometheus recorder")?;

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let hub = Arc::new(BroadcastHub::new(config.broadcast.capacity));
    let gateway = build_gateway(&config);
    let session = ConnectionManager::new(gateway, hub.clone(), config.session_config());

    let control_state = Arc::new(ControlState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        session.clone(),
        Arc::clone(&hub),
        ControlDefaults::from_config(&config),
    ));
    let control_server = ControlServer::new(
        config.server.control_port,
        control_state,
        shutdown_token.clone(),
    );

    let server = tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            tracing::error!(error = %e, "Control server error");
        }
    });

    tracing::info!(session_id = %session.session_id(), "Session bridge ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, session.disconnect())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Gateway session did not close in time"
        );
    }
    let _ = server.await;

    tracing::info!("Session bridge stopped");
    Ok(())
}

/// Build the gateway client selected by `TWS_GATEWAY_MODE`.
fn build_gateway(config: &BridgeConfig) -> Arc<dyn GatewayClient> {
    match config.gateway.mode {
        GatewayMode::Simulated => Arc::new(SimulatedGateway::new(SimulatorConfig::from_settings(
            &config.simulator,
        ))),
        GatewayMode::Bridge => Arc::new(BridgeGateway::new(BridgeGatewayConfig::from_settings(
            &config.gateway,
        ))),
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        mode = config.gateway.mode.as_str(),
        gateway = %format!("{}:{}", config.gateway.host, config.gateway.port),
        client_id = config.gateway.client_id,
        control_port = config.server.control_port,
        default_symbol = %config.session.default_symbol,
        "Configuration loaded"
    );
    if config.gateway.mode == GatewayMode::Bridge {
        tracing::debug!(bridge_url = %config.bridge_url(), "Gateway bridge endpoint");
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
