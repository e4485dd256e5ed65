//! Simulated Gateway
//!
//! In-process [`GatewayClient`] for demos and tests. It records every
//! outbound call, lets callers inject arbitrary inbound messages, and can
//! play the gateway's part on its own: acknowledge the handshake, announce a
//! request id seed, and stream a random-walk `Last` price with cumulative
//! `Volume` for each active request.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{GatewayClient, GatewayMessage, GatewayStream, TransportError};
use crate::domain::market_data::{ContractSpec, RequestId, TickKind};
use crate::infrastructure::config::SimulatorSettings;

/// Capacity of the inbound message channel.
const INBOUND_CAPACITY: usize = 256;

/// Configuration for the simulated gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Acknowledge the handshake as soon as a session opens.
    pub auto_ack: bool,
    /// Seed announced through `NextValidId` after the acknowledgment.
    pub next_valid_id: RequestId,
    /// Stream ticks for active requests.
    pub stream_ticks: bool,
    /// Interval between ticks.
    pub tick_interval: Duration,
    /// Starting price of every random walk.
    pub start_price: f64,
    /// RNG seed for reproducible walks.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            auto_ack: true,
            next_valid_id: 1,
            stream_ticks: true,
            tick_interval: Duration::from_millis(500),
            start_price: 100.0,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    /// A silent gateway: no acknowledgment, no ticks. Tests drive it by
    /// injecting messages.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            auto_ack: false,
            stream_ticks: false,
            ..Self::default()
        }
    }

    /// Create configuration from `SimulatorSettings`.
    #[must_use]
    pub fn from_settings(settings: &SimulatorSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval,
            start_price: settings.start_price,
            ..Self::default()
        }
    }
}

/// An outbound call received by the simulated gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `open_session`.
    Open {
        /// Host.
        host: String,
        /// Port.
        port: u16,
        /// Client identifier.
        client_id: i32,
    },
    /// `close_session`.
    Close,
    /// `request_market_data`.
    Request {
        /// Request identifier.
        request_id: RequestId,
        /// Requested contract.
        contract: ContractSpec,
    },
    /// `cancel_market_data`.
    Cancel {
        /// Request identifier.
        request_id: RequestId,
    },
}

struct SimSession {
    inbound: mpsc::Sender<GatewayMessage>,
    cancel: CancellationToken,
    tickers: HashMap<RequestId, CancellationToken>,
}

/// In-process gateway.
pub struct SimulatedGateway {
    config: SimulatorConfig,
    calls: Mutex<Vec<GatewayCall>>,
    session: Mutex<Option<SimSession>>,
}

impl std::fmt::Debug for SimulatedGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedGateway")
            .field("config", &self.config)
            .field("calls", &self.calls.lock().len())
            .field("open", &self.session.lock().is_some())
            .finish()
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimulatedGateway {
    /// Create a simulated gateway.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(Vec::new()),
            session: Mutex::new(None),
        }
    }

    /// Every outbound call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Requests currently streaming ticks.
    #[must_use]
    pub fn active_requests(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.tickers.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Deliver `message` on the open session's stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] if no session is open, or
    /// [`TransportError::SendFailed`] if the reader has gone away.
    pub async fn inject(&self, message: GatewayMessage) -> Result<(), TransportError> {
        let inbound = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.inbound.clone())
            .ok_or(TransportError::NotConnected)?;

        inbound
            .send(message)
            .await
            .map_err(|_| TransportError::SendFailed("session stream closed".to_string()))
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().push(call);
    }

    fn rng(&self, request_id: RequestId) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(request_id.unsigned_abs())),
            None => StdRng::from_rng(&mut rand::rng()),
        }
    }
}

#[async_trait]
impl GatewayClient for SimulatedGateway {
    async fn open_session(
        &self,
        host: &str,
        port: u16,
        client_id: i32,
    ) -> Result<GatewayStream, TransportError> {
        self.record(GatewayCall::Open {
            host: host.to_string(),
            port,
            client_id,
        });

        let (inbound, rx) = mpsc::channel(INBOUND_CAPACITY);
        if self.config.auto_ack {
            // Fresh channel, so these cannot fail for lack of capacity.
            let _ = inbound.try_send(GatewayMessage::ConnectAck);
            let _ = inbound.try_send(GatewayMessage::NextValidId(self.config.next_valid_id));
        }

        let previous = self.session.lock().replace(SimSession {
            inbound,
            cancel: CancellationToken::new(),
            tickers: HashMap::new(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        tracing::debug!(host, port, client_id, "Simulated session opened");
        Ok(rx)
    }

    async fn close_session(&self) -> Result<(), TransportError> {
        self.record(GatewayCall::Close);

        let session = self.session.lock().take().ok_or(TransportError::NotConnected)?;
        session.cancel.cancel();
        let _ = session.inbound.try_send(GatewayMessage::ConnectionClosed);

        tracing::debug!("Simulated session closed");
        Ok(())
    }

    async fn request_market_data(
        &self,
        request_id: RequestId,
        contract: &ContractSpec,
    ) -> Result<(), TransportError> {
        self.record(GatewayCall::Request {
            request_id,
            contract: contract.clone(),
        });

        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(TransportError::NotConnected)?;

        if self.config.stream_ticks {
            let cancel = session.cancel.child_token();
            session.tickers.insert(request_id, cancel.clone());
            tokio::spawn(run_ticker(Ticker {
                request_id,
                inbound: session.inbound.clone(),
                interval: self.config.tick_interval,
                price: self.config.start_price,
                rng: self.rng(request_id),
                cancel,
            }));
        }

        Ok(())
    }

    async fn cancel_market_data(&self, request_id: RequestId) -> Result<(), TransportError> {
        self.record(GatewayCall::Cancel { request_id });

        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(TransportError::NotConnected)?;
        if let Some(ticker) = session.tickers.remove(&request_id) {
            ticker.cancel();
        }
        Ok(())
    }
}

struct Ticker {
    request_id: RequestId,
    inbound: mpsc::Sender<GatewayMessage>,
    interval: Duration,
    price: f64,
    rng: StdRng,
    cancel: CancellationToken,
}

async fn run_ticker(mut ticker: Ticker) {
    let mut interval = tokio::time::interval(ticker.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut volume: i64 = 0;

    loop {
        tokio::select! {
            () = ticker.cancel.cancelled() => break,
            _ = interval.tick() => {
                let step: f64 = ticker.rng.random_range(-0.005..=0.005);
                ticker.price = (ticker.price * (1.0 + step)).max(0.01);
                volume += ticker.rng.random_range(1..=50) * 100;

                let price = GatewayMessage::TickPrice {
                    request_id: ticker.request_id,
                    tick_type: TickKind::Last.code(),
                    price: (ticker.price * 100.0).round() / 100.0,
                };
                let size = GatewayMessage::TickSize {
                    request_id: ticker.request_id,
                    tick_type: TickKind::Volume.code(),
                    size: volume,
                };

                if ticker.inbound.send(price).await.is_err()
                    || ticker.inbound.send(size).await.is_err()
                {
                    break;
                }
            }
        }
    }

    tracing::trace!(request_id = ticker.request_id, "Simulated ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming() -> SimulatorConfig {
        SimulatorConfig {
            tick_interval: Duration::from_millis(10),
            seed: Some(7),
            ..SimulatorConfig::default()
        }
    }

    #[tokio::test]
    async fn auto_ack_sends_handshake_then_seed() {
        let gateway = SimulatedGateway::new(SimulatorConfig {
            next_valid_id: 42,
            ..SimulatorConfig::default()
        });

        let mut rx = gateway.open_session("127.0.0.1", 4002, 1).await.unwrap();

        assert_eq!(rx.recv().await, Some(GatewayMessage::ConnectAck));
        assert_eq!(rx.recv().await, Some(GatewayMessage::NextValidId(42)));
    }

    #[tokio::test]
    async fn manual_mode_is_silent_until_injected() {
        let gateway = SimulatedGateway::new(SimulatorConfig::manual());
        let mut rx = gateway.open_session("127.0.0.1", 4002, 1).await.unwrap();

        assert!(rx.try_recv().is_err());

        gateway.inject(GatewayMessage::ConnectAck).await.unwrap();
        assert_eq!(rx.recv().await, Some(GatewayMessage::ConnectAck));
    }

    #[tokio::test]
    async fn calls_are_recorded_in_order() {
        let gateway = SimulatedGateway::new(SimulatorConfig::manual());
        let _rx = gateway.open_session("10.0.0.1", 7497, 3).await.unwrap();
        gateway
            .request_market_data(1, &ContractSpec::stock("AAPL"))
            .await
            .unwrap();
        gateway.cancel_market_data(1).await.unwrap();
        gateway.close_session().await.unwrap();

        assert_eq!(
            gateway.calls(),
            vec![
                GatewayCall::Open {
                    host: "10.0.0.1".to_string(),
                    port: 7497,
                    client_id: 3,
                },
                GatewayCall::Request {
                    request_id: 1,
                    contract: ContractSpec::stock("AAPL"),
                },
                GatewayCall::Cancel { request_id: 1 },
                GatewayCall::Close,
            ]
        );
    }

    #[tokio::test]
    async fn close_emits_connection_closed() {
        let gateway = SimulatedGateway::new(SimulatorConfig::manual());
        let mut rx = gateway.open_session("127.0.0.1", 4002, 1).await.unwrap();

        gateway.close_session().await.unwrap();

        assert_eq!(rx.recv().await, Some(GatewayMessage::ConnectionClosed));
        assert!(!gateway.is_open());
        assert_eq!(gateway.close_session().await, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn request_streams_last_and_volume() {
        let gateway = SimulatedGateway::new(SimulatorConfig {
            auto_ack: false,
            ..streaming()
        });
        let mut rx = gateway.open_session("127.0.0.1", 4002, 1).await.unwrap();
        gateway
            .request_market_data(9, &ContractSpec::stock("AAPL"))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = rx.recv().await.unwrap();

        assert!(matches!(
            first,
            GatewayMessage::TickPrice { request_id: 9, tick_type: 4, price } if price > 0.0
        ));
        assert!(matches!(
            second,
            GatewayMessage::TickSize { request_id: 9, tick_type: 8, size } if size > 0
        ));
        assert_eq!(gateway.active_requests(), vec![9]);
    }

    #[tokio::test]
    async fn cancel_stops_ticker() {
        let gateway = SimulatedGateway::new(SimulatorConfig {
            auto_ack: false,
            ..streaming()
        });
        let mut rx = gateway.open_session("127.0.0.1", 4002, 1).await.unwrap();
        gateway
            .request_market_data(1, &ContractSpec::stock("AAPL"))
            .await
            .unwrap();
        let _ = rx.recv().await;

        gateway.cancel_market_data(1).await.unwrap();
        assert!(gateway.active_requests().is_empty());

        // Drain what was in flight, then expect silence.
        tokio::time::sleep(Duration::from_millis(30)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn requests_without_session_fail() {
        let gateway = SimulatedGateway::new(SimulatorConfig::manual());

        assert_eq!(
            gateway
                .request_market_data(1, &ContractSpec::stock("AAPL"))
                .await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            gateway.inject(GatewayMessage::ConnectAck).await,
            Err(TransportError::NotConnected)
        );
    }
}
