//! Gateway Bridge Client
//!
//! [`GatewayClient`] over a WebSocket to a gateway bridge sidecar, which
//! speaks the native gateway API on one side and JSON frames on the other.
//!
//! # Protocol
//!
//! After the socket opens the client sends `start_api` with its client id.
//! The bridge answers with `connect_ack` and `next_valid_id`, then streams
//! ticks for every `req_mkt_data` until the matching `cancel_mkt_data`.
//!
//! A single pump task owns the socket. It writes queued commands, answers
//! pings, pings an idle peer, and decodes frames onto the session stream.
//! Socket end and a silent peer both surface as `ConnectionClosed`. Frames
//! that fail to encode or decode surface as an `Error` with
//! [`PROTOCOL_ERROR_CODE`], so the session journals them.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::BridgeCodec;
use super::messages::BridgeCommand;
use crate::application::ports::{
    GatewayClient, GatewayMessage, GatewayStream, PROTOCOL_ERROR_CODE, TransportError,
};
use crate::domain::market_data::{ContractSpec, RequestId};
use crate::infrastructure::config::GatewaySettings;

/// Capacity of the inbound message channel.
const INBOUND_CAPACITY: usize = 1024;

/// Capacity of the outbound command queue.
const COMMAND_CAPACITY: usize = 64;

/// Time the pump gets to flush `disconnect` before it is cancelled.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type BridgeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the bridge client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeGatewayConfig {
    /// WebSocket path on the bridge host.
    pub path: String,
    /// Interval between pings to the bridge.
    pub ping_interval: Duration,
    /// Silence after which the bridge is considered gone.
    pub idle_timeout: Duration,
}

impl Default for BridgeGatewayConfig {
    fn default() -> Self {
        Self::from_settings(&GatewaySettings::default())
    }
}

impl BridgeGatewayConfig {
    /// Build from the gateway settings.
    #[must_use]
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            path: settings.bridge_path.clone(),
            ping_interval: settings.heartbeat_interval,
            idle_timeout: settings.heartbeat_timeout,
        }
    }

    /// WebSocket URL for `host:port`.
    #[must_use]
    pub fn url(&self, host: &str, port: u16) -> String {
        format!("ws://{host}:{port}{}", self.path)
    }
}

struct BridgeLink {
    commands: mpsc::Sender<BridgeCommand>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// WebSocket client for the gateway bridge.
pub struct BridgeGateway {
    config: BridgeGatewayConfig,
    link: Mutex<Option<BridgeLink>>,
}

impl std::fmt::Debug for BridgeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeGateway")
            .field("config", &self.config)
            .field("open", &self.link.lock().is_some())
            .finish()
    }
}

impl BridgeGateway {
    /// Create a bridge client.
    #[must_use]
    pub const fn new(config: BridgeGatewayConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
        }
    }

    async fn send(&self, command: BridgeCommand) -> Result<(), TransportError> {
        let commands = self
            .link
            .lock()
            .as_ref()
            .map(|l| l.commands.clone())
            .ok_or(TransportError::NotConnected)?;

        commands
            .send(command)
            .await
            .map_err(|_| TransportError::SendFailed("bridge socket closed".to_string()))
    }

    async fn shutdown(link: BridgeLink) {
        // Dropping the last sender lets the pump flush and close the socket.
        let _ = link.commands.send(BridgeCommand::Disconnect).await;
        drop(link.commands);

        let mut pump = link.pump;
        if tokio::time::timeout(CLOSE_GRACE, &mut pump).await.is_err() {
            link.cancel.cancel();
            let _ = pump.await;
        }
    }
}

#[async_trait]
impl GatewayClient for BridgeGateway {
    async fn open_session(
        &self,
        host: &str,
        port: u16,
        client_id: i32,
    ) -> Result<GatewayStream, TransportError> {
        let url = self.config.url(host, port);
        tracing::info!(url = %url, client_id, "Connecting to gateway bridge");

        let (socket, _response) =
            tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| match e {
                    WsError::Io(io) => TransportError::ConnectFailed {
                        address: url.clone(),
                        reason: io.to_string(),
                    },
                    other => TransportError::WebSocket(other.to_string()),
                })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run_pump(Pump {
            socket,
            commands: command_rx,
            inbound: inbound_tx,
            codec: BridgeCodec::new(),
            ping_interval: self.config.ping_interval,
            idle_timeout: self.config.idle_timeout,
            cancel: cancel.clone(),
        }));

        commands
            .send(BridgeCommand::StartApi { client_id })
            .await
            .map_err(|_| TransportError::SendFailed("bridge socket closed".to_string()))?;

        let previous = self.link.lock().replace(BridgeLink {
            commands,
            cancel,
            pump,
        });
        if let Some(previous) = previous {
            tracing::warn!("Replacing an open bridge session");
            Self::shutdown(previous).await;
        }

        Ok(inbound_rx)
    }

    async fn close_session(&self) -> Result<(), TransportError> {
        let link = self.link.lock().take().ok_or(TransportError::NotConnected)?;
        Self::shutdown(link).await;
        tracing::info!("Gateway bridge session closed");
        Ok(())
    }

    async fn request_market_data(
        &self,
        request_id: RequestId,
        contract: &ContractSpec,
    ) -> Result<(), TransportError> {
        self.send(BridgeCommand::request(request_id, contract)).await
    }

    async fn cancel_market_data(&self, request_id: RequestId) -> Result<(), TransportError> {
        self.send(BridgeCommand::CancelMktData { req_id: request_id })
            .await
    }
}

// =============================================================================
// Socket Pump
// =============================================================================

struct Pump {
    socket: BridgeSocket,
    commands: mpsc::Receiver<BridgeCommand>,
    inbound: mpsc::Sender<GatewayMessage>,
    codec: BridgeCodec,
    ping_interval: Duration,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    /// Closed from our side; the session already knows.
    Local,
    /// The socket or the peer went away.
    Remote,
}

fn protocol_error(text: String) -> GatewayMessage {
    GatewayMessage::Error {
        request_id: -1,
        code: PROTOCOL_ERROR_CODE,
        text,
    }
}

/// Decode `text` onto the session stream.
///
/// Returns `false` once the session stream is gone.
async fn forward(
    codec: &BridgeCodec,
    text: &str,
    inbound: &mpsc::Sender<GatewayMessage>,
) -> bool {
    let results = codec.decode(text).unwrap_or_else(|e| vec![Err(e)]);

    for result in results {
        let message = result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Undecodable bridge frame");
            protocol_error(format!("Undecodable bridge frame: {e}"))
        });
        if inbound.send(message).await.is_err() {
            return false;
        }
    }
    true
}

async fn run_pump(pump: Pump) {
    let Pump {
        socket,
        mut commands,
        inbound,
        codec,
        ping_interval,
        idle_timeout,
        cancel,
    } = pump;
    let (mut write, mut read) = socket.split();

    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();

    let exit = loop {
        tokio::select! {
            () = cancel.cancelled() => break PumpExit::Local,

            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = write.send(Message::Close(None)).await;
                    break PumpExit::Local;
                };
                let text = match codec.encode(&command) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, ?command, "Failed to encode bridge command");
                        let _ = inbound
                            .send(protocol_error(format!("Unsendable bridge command: {e}")))
                            .await;
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "Bridge write failed");
                    break PumpExit::Remote;
                }
            }

            _ = ping.tick() => {
                let idle = last_seen.elapsed();
                if idle > idle_timeout {
                    tracing::warn!(
                        idle_ms = idle.as_millis(),
                        timeout_ms = idle_timeout.as_millis(),
                        "Gateway bridge went silent"
                    );
                    break PumpExit::Remote;
                }
                if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break PumpExit::Remote;
                }
            }

            frame = read.next() => {
                if let Some(Ok(_)) = &frame {
                    last_seen = Instant::now();
                }
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !forward(&codec, &text, &inbound).await {
                            tracing::debug!("Session stream dropped, closing bridge");
                            break PumpExit::Local;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break PumpExit::Remote;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Gateway bridge sent close frame");
                        break PumpExit::Remote;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Gateway bridge socket error");
                        break PumpExit::Remote;
                    }
                    None => {
                        tracing::info!("Gateway bridge stream ended");
                        break PumpExit::Remote;
                    }
                }
                if inbound.is_closed() {
                    break PumpExit::Local;
                }
            }
        }
    };

    if exit == PumpExit::Remote {
        let _ = inbound.send(GatewayMessage::ConnectionClosed).await;
    }
    tracing::debug!(?exit, "Bridge pump stopped");
}
