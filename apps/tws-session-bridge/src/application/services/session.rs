//! Connection Manager
//!
//! Owns the connection state machine of the single gateway session, the
//! background read loop, and the orchestration of the registry, dispatcher
//! and journal on every inbound callback.
//!
//! # State Machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --connectAck--> Connected
//! Connected --disconnect()--> Disconnecting --teardown--> Disconnected
//! Connecting --timeout / disconnect() / fatal error--> Disconnected
//! Connected --connectionClosed / fatal error--> Disconnected
//! ```
//!
//! # Concurrency
//!
//! Caller operations (`connect`, `disconnect`, `subscribe`) are serialized by
//! an async control lock. `connect` releases it while the gateway session
//! opens, so `disconnect` can cancel a pending open. One deadline covers the
//! open and the handshake. The read loop never takes the lock: state changes go
//! through compare-and-set on a watch channel, so a transition observed by
//! one side is never applied twice by the other. `connection_status` is
//! published only by the side that wins the transition out of an active
//! state, which makes the `disconnected` notice exactly-once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{
    ConnectionError, EventPublisher, GatewayClient, GatewayError, GatewayEventSink, GatewayMessage,
    GatewayStream, SessionController, SessionStatus,
};
use crate::application::services::{
    DispatcherConfig, EventJournal, SubscriptionRegistry, TickDispatcher,
};
use crate::domain::buffer::DEFAULT_LOG_CAPACITY;
use crate::domain::market_data::{
    ConnectionState, ContractSpec, LinkStatus, LogEntry, RequestId, SessionEvent, TickEvent,
};
use crate::domain::subscription::{
    DEFAULT_INITIAL_REQUEST_ID, RequestIdAllocator, SubscriptionError,
};
use crate::infrastructure::metrics::{self, ConnectOutcome};

/// Default time `connect` waits for the handshake acknowledgment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a gateway session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// How long `connect` waits for the handshake acknowledgment.
    pub connect_timeout: Duration,
    /// Capacity of the log history.
    pub log_capacity: usize,
    /// Tick dispatch settings.
    pub dispatcher: DispatcherConfig,
    /// Request identifier used before the gateway announces its own.
    pub initial_request_id: RequestId,
    /// Contract template; the symbol is replaced per subscription.
    pub contract: ContractSpec,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            log_capacity: DEFAULT_LOG_CAPACITY,
            dispatcher: DispatcherConfig::default(),
            initial_request_id: DEFAULT_INITIAL_REQUEST_ID,
            contract: ContractSpec::stock(""),
        }
    }
}

// =============================================================================
// Session Core
// =============================================================================

struct ReadLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SessionCore {
    id: Uuid,
    state: watch::Sender<ConnectionState>,
    control: tokio::sync::Mutex<()>,
    attempt: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<ReadLoop>>,
    gateway: Arc<dyn GatewayClient>,
    allocator: Arc<RequestIdAllocator>,
    registry: SubscriptionRegistry,
    dispatcher: TickDispatcher,
    journal: Arc<EventJournal>,
    publisher: Arc<dyn EventPublisher>,
    config: SessionConfig,
}

impl SessionCore {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` unconditionally. Returns the previous state.
    fn transition(&self, next: ConnectionState) -> ConnectionState {
        let mut previous = next;
        self.state.send_if_modified(|state| {
            previous = *state;
            *state = next;
            previous != next
        });
        metrics::set_connection_state(self.state());
        previous
    }

    /// Move from `from` to `to`. Returns `false` if the state was not `from`.
    fn compare_and_set(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let swapped = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if swapped {
            metrics::set_connection_state(to);
        }
        swapped
    }

    fn publish_status(&self, status: LinkStatus) {
        let event = SessionEvent::ConnectionStatus { status };
        let name = event.name();
        let reached = self.publisher.publish(event);
        metrics::record_event_published(name, reached);
    }

    /// Enter Disconnected and drop the local subscription.
    ///
    /// Publishes `disconnected` only when leaving an active state. Returns the
    /// state that was left.
    fn mark_disconnected(&self) -> ConnectionState {
        let previous = self.transition(ConnectionState::Disconnected);
        self.registry.clear_local();
        if matches!(
            previous,
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.publish_status(LinkStatus::Disconnected);
        }
        previous
    }

    fn spawn_read_loop(self: &Arc<Self>, stream: GatewayStream) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_read_loop(Arc::clone(self), stream, cancel.clone()));
        *self.worker.lock() = Some(ReadLoop { cancel, handle });
    }

    /// Cancel the read loop and wait for it to exit.
    ///
    /// Returns `false` if no read loop was running.
    async fn stop_worker(&self) -> bool {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await
                && e.is_panic()
            {
                tracing::error!(session_id = %self.id, error = %e, "Read loop panicked");
                self.journal.error(format!("Read loop failed: {e}"));
            }
            true
        } else {
            false
        }
    }

    async fn close_gateway(&self, context: &str) {
        if let Err(e) = self.gateway.close_session().await {
            tracing::warn!(session_id = %self.id, error = %e, context, "Gateway close failed");
            self.journal.error(format!("{context}: {e}"));
        }
    }

    /// Tear down a session whose handshake never completed.
    ///
    /// Cancels a pending open. The gateway session is closed only if it was
    /// opened. Returns `false` if the handshake completed first.
    async fn abort_handshake(&self) -> bool {
        if !self.compare_and_set(ConnectionState::Connecting, ConnectionState::Disconnected) {
            return false;
        }
        let attempt = self.attempt.lock().take();
        if let Some(attempt) = attempt {
            attempt.cancel();
        }
        if self.stop_worker().await {
            self.close_gateway("Close after aborted handshake failed")
                .await;
        }
        self.registry.clear_local();
        true
    }
}

impl GatewayEventSink for SessionCore {
    fn connect_ack(&self) {
        if self.compare_and_set(ConnectionState::Connecting, ConnectionState::Connected) {
            self.journal.info("Connected to gateway");
            self.publish_status(LinkStatus::Connected);
        } else {
            tracing::debug!(session_id = %self.id, state = %self.state(), "Ignoring late handshake acknowledgment");
        }
    }

    fn connection_closed(&self) {
        if self.mark_disconnected() != ConnectionState::Disconnected {
            self.journal.info("Connection closed");
        }
    }

    fn error(&self, request_id: RequestId, code: i32, text: &str) -> bool {
        let error = GatewayError::new(request_id, code, text);
        metrics::record_gateway_error(error.class());

        if error.is_informational() {
            self.journal.info(error.to_string());
        } else {
            self.journal.error(error.to_string());
        }

        if error.is_session_fatal() {
            tracing::warn!(session_id = %self.id, code, "Session-fatal gateway error");
            self.mark_disconnected();
            true
        } else {
            false
        }
    }

    fn tick_price(&self, request_id: RequestId, tick_type: i32, price: f64) {
        let routed = self.registry.route(request_id, |subscription| {
            self.dispatcher
                .on_tick_price(subscription.symbol(), tick_type, price)
        });
        if routed.is_none() {
            tracing::trace!(request_id, tick_type, "Dropping tick for inactive request");
        }
    }

    fn tick_size(&self, request_id: RequestId, tick_type: i32, size: i64) {
        let routed = self.registry.route(request_id, |subscription| {
            self.dispatcher
                .on_tick_size(subscription.symbol(), tick_type, size)
        });
        if routed.is_none() {
            tracing::trace!(request_id, tick_type, "Dropping tick for inactive request");
        }
    }

    fn next_valid_id(&self, request_id: RequestId) {
        let next = self.allocator.seed(request_id);
        if next != request_id {
            tracing::debug!(announced = request_id, next, "Keeping higher local request id");
        }
        self.journal.info(format!("Next valid request id: {request_id}"));
    }
}

/// Outcome of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Stop,
}

fn handle_message(core: &SessionCore, message: GatewayMessage) -> LoopControl {
    match message {
        GatewayMessage::ConnectAck => core.connect_ack(),
        GatewayMessage::ConnectionClosed => {
            core.connection_closed();
            return LoopControl::Stop;
        }
        GatewayMessage::Error {
            request_id,
            code,
            text,
        } => {
            if core.error(request_id, code, &text) {
                return LoopControl::Stop;
            }
        }
        GatewayMessage::TickPrice {
            request_id,
            tick_type,
            price,
        } => core.tick_price(request_id, tick_type, price),
        GatewayMessage::TickSize {
            request_id,
            tick_type,
            size,
        } => core.tick_size(request_id, tick_type, size),
        GatewayMessage::NextValidId(id) => core.next_valid_id(id),
    }
    LoopControl::Continue
}

async fn run_read_loop(core: Arc<SessionCore>, mut stream: GatewayStream, cancel: CancellationToken) {
    tracing::debug!(session_id = %core.id, "Read loop started");

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!(session_id = %core.id, "Read loop cancelled");
                break;
            }

            message = stream.recv() => {
                let Some(message) = message else {
                    core.connection_closed();
                    break;
                };

                let fatal = matches!(message, GatewayMessage::Error { .. });
                if handle_message(&core, message) == LoopControl::Stop {
                    if fatal {
                        core.close_gateway("Close after fatal error failed").await;
                    }
                    break;
                }
            }
        }
    }

    tracing::debug!(session_id = %core.id, "Read loop stopped");
}

// =============================================================================
// Connection Manager
// =============================================================================

/// The gateway session: state machine, read loop and event orchestration.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("session_id", &self.core.id)
            .field("state", &self.core.state())
            .field("subscription", &self.core.registry.current())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a session over `gateway` publishing to `publisher`.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn GatewayClient>,
        publisher: Arc<dyn EventPublisher>,
        config: SessionConfig,
    ) -> Self {
        let allocator = Arc::new(RequestIdAllocator::new(config.initial_request_id));
        let journal = Arc::new(EventJournal::new(config.log_capacity, Arc::clone(&publisher)));
        let dispatcher =
            TickDispatcher::new(config.dispatcher, Arc::clone(&journal), Arc::clone(&publisher));
        let registry = SubscriptionRegistry::new(
            Arc::clone(&gateway),
            Arc::clone(&allocator),
            config.contract.clone(),
        );
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            core: Arc::new(SessionCore {
                id: Uuid::new_v4(),
                state,
                control: tokio::sync::Mutex::new(()),
                attempt: Mutex::new(None),
                worker: Mutex::new(None),
                gateway,
                allocator,
                registry,
                dispatcher,
                journal,
                publisher,
                config,
            }),
        }
    }

    /// Session identifier used in traces.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.core.id
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Identifier the next subscription will use.
    #[must_use]
    pub fn next_request_id(&self) -> RequestId {
        self.core.allocator.peek()
    }

    /// Copy of the price history, oldest first.
    #[must_use]
    pub fn price_history(&self) -> Vec<TickEvent> {
        self.core.dispatcher.snapshot()
    }

    /// Most recent buffered price tick.
    #[must_use]
    pub fn latest_price(&self) -> Option<TickEvent> {
        self.core.dispatcher.latest()
    }

    /// Copy of the log history, oldest first.
    #[must_use]
    pub fn log_history(&self) -> Vec<LogEntry> {
        self.core.journal.snapshot()
    }

    /// Cancel the active subscription without replacing it.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::CancelFailed`] if the gateway call failed;
    /// the local record is cleared regardless.
    pub async fn unsubscribe(&self) -> Result<(), SubscriptionError> {
        let _guard = self.core.control.lock().await;
        match self.core.registry.cancel().await {
            Ok(Some(previous)) => {
                self.core
                    .journal
                    .info(format!("Cancelled market data for {}", previous.symbol()));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.core.journal.error(e.to_string());
                Err(e)
            }
        }
    }

    /// Open the gateway session and start the read loop.
    ///
    /// Runs without the control lock so `disconnect` can cancel the open.
    async fn open(
        &self,
        host: &str,
        port: u16,
        client_id: i32,
        attempt: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<watch::Receiver<ConnectionState>, ConnectionError> {
        let opened = tokio::select! {
            biased;

            () = attempt.cancelled() => {
                metrics::record_connect_attempt(ConnectOutcome::Aborted);
                tracing::info!(session_id = %self.core.id, "Gateway open cancelled");
                return Err(ConnectionError::Aborted);
            }

            opened = tokio::time::timeout_at(
                deadline,
                self.core.gateway.open_session(host, port, client_id),
            ) => opened,
        };

        let _guard = self.core.control.lock().await;
        match opened {
            Err(_) => Err(self.handshake_timed_out(attempt).await),
            Ok(Err(e)) => {
                if attempt.is_cancelled()
                    || !self
                        .core
                        .compare_and_set(ConnectionState::Connecting, ConnectionState::Disconnected)
                {
                    metrics::record_connect_attempt(ConnectOutcome::Aborted);
                    return Err(ConnectionError::Aborted);
                }
                metrics::record_connect_attempt(ConnectOutcome::Failed);
                self.core.journal.error(format!("Connection error: {e}"));
                Err(e.into())
            }
            Ok(Ok(stream)) => {
                if attempt.is_cancelled() {
                    // A newer attempt owns the gateway unless the session is still down.
                    drop(stream);
                    if self.core.state() == ConnectionState::Disconnected {
                        self.core
                            .close_gateway("Close after aborted handshake failed")
                            .await;
                    }
                    metrics::record_connect_attempt(ConnectOutcome::Aborted);
                    return Err(ConnectionError::Aborted);
                }
                let changes = self.core.state.subscribe();
                self.core.spawn_read_loop(stream);
                Ok(changes)
            }
        }
    }

    /// Abort the attempt after the deadline. Call with the control lock held.
    async fn handshake_timed_out(&self, attempt: &CancellationToken) -> ConnectionError {
        let timeout = self.core.config.connect_timeout;
        if !attempt.is_cancelled() && self.core.abort_handshake().await {
            let err = ConnectionError::HandshakeTimeout(timeout);
            metrics::record_connect_attempt(ConnectOutcome::TimedOut);
            self.core.journal.error(format!("Connection error: {err}"));
            err
        } else {
            metrics::record_connect_attempt(ConnectOutcome::Aborted);
            ConnectionError::Aborted
        }
    }

    async fn await_handshake(
        &self,
        mut changes: watch::Receiver<ConnectionState>,
        address: &str,
        started: Instant,
        attempt: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<(), ConnectionError> {
        let settled = tokio::time::timeout_at(deadline, async {
            changes
                .wait_for(|state| *state != ConnectionState::Connecting)
                .await
                .map(|state| *state)
        })
        .await;

        match settled {
            Ok(Ok(ConnectionState::Connected)) => {
                metrics::record_connect_attempt(ConnectOutcome::Connected);
                metrics::record_handshake_duration(started.elapsed());
                tracing::info!(session_id = %self.core.id, address, "Connected to gateway");
                Ok(())
            }
            Ok(_) => {
                metrics::record_connect_attempt(ConnectOutcome::Aborted);
                tracing::info!(session_id = %self.core.id, address, "Connection attempt aborted");
                Err(ConnectionError::Aborted)
            }
            Err(_) => {
                let _guard = self.core.control.lock().await;
                if self.core.state().is_connected() {
                    metrics::record_connect_attempt(ConnectOutcome::Connected);
                    Ok(())
                } else {
                    Err(self.handshake_timed_out(attempt).await)
                }
            }
        }
    }
}

#[async_trait]
impl SessionController for ConnectionManager {
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<(), ConnectionError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.core.config.connect_timeout;
        let address = format!("{host}:{port}");

        let attempt = {
            let _guard = self.core.control.lock().await;

            let current = self.core.state();
            if current != ConnectionState::Disconnected {
                metrics::record_connect_attempt(ConnectOutcome::Rejected);
                return Err(ConnectionError::AlreadyActive(current.to_string()));
            }

            // A loop that ended on its own may still be parked in the slot.
            self.core.stop_worker().await;
            let attempt = CancellationToken::new();
            *self.core.attempt.lock() = Some(attempt.clone());
            self.core.transition(ConnectionState::Connecting);
            tracing::info!(session_id = %self.core.id, address = %address, client_id, "Opening gateway session");
            attempt
        };

        let changes = self
            .open(host, port, client_id, &attempt, deadline)
            .await?;
        self.await_handshake(changes, &address, started, &attempt, deadline)
            .await
    }

    async fn disconnect(&self) {
        let _guard = self.core.control.lock().await;

        match self.core.state() {
            ConnectionState::Connecting => {
                if self.core.abort_handshake().await {
                    self.core.journal.info("Connection attempt aborted");
                    return;
                }
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                tracing::debug!(session_id = %self.core.id, "Disconnect ignored, no active session");
                return;
            }
            ConnectionState::Connected => {}
        }

        if !self
            .core
            .compare_and_set(ConnectionState::Connected, ConnectionState::Disconnecting)
        {
            return;
        }

        if let Err(e) = self.core.gateway.close_session().await {
            self.core.journal.error(format!("Disconnect error: {e}"));
        }
        self.core.stop_worker().await;
        self.core.attempt.lock().take();

        if self.core.mark_disconnected() != ConnectionState::Disconnected {
            self.core.journal.info("Disconnected from gateway");
        }
    }

    async fn subscribe(&self, symbol: &str) -> Result<RequestId, SubscriptionError> {
        let _guard = self.core.control.lock().await;

        let state = self.core.state();
        let result = self
            .core
            .registry
            .subscribe(symbol, state, || self.core.dispatcher.clear())
            .await;

        match result {
            Ok(receipt) => {
                if let Some(failure) = &receipt.cancel_failure {
                    self.core.journal.error(failure.to_string());
                }
                self.core
                    .journal
                    .info(format!("Requesting market data for {}", receipt.symbol));
                Ok(receipt.request_id)
            }
            Err(e) => {
                self.core.journal.error(format!("Subscription error: {e}"));
                Err(e)
            }
        }
    }

    fn status(&self) -> SessionStatus {
        let state = self.core.state();
        SessionStatus {
            connected: state.is_connected(),
            state,
            symbol: self.core.registry.symbol(),
            buffered_points: self.core.dispatcher.len(),
        }
    }
}

impl GatewayEventSink for ConnectionManager {
    fn connect_ack(&self) {
        self.core.connect_ack();
    }

    fn connection_closed(&self) {
        self.core.connection_closed();
    }

    fn error(&self, request_id: RequestId, code: i32, text: &str) -> bool {
        self.core.error(request_id, code, text)
    }

    fn tick_price(&self, request_id: RequestId, tick_type: i32, price: f64) {
        self.core.tick_price(request_id, tick_type, price);
    }

    fn tick_size(&self, request_id: RequestId, tick_type: i32, size: i64) {
        self.core.tick_size(request_id, tick_type, size);
    }

    fn next_valid_id(&self, request_id: RequestId) {
        self.core.next_valid_id(request_id);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::{MockGatewayClient, TransportError};
    use crate::application::services::journal::tests::RecordingPublisher;
    use crate::domain::market_data::LogLevel;

    struct Harness {
        manager: ConnectionManager,
        publisher: Arc<RecordingPublisher>,
        inbound: mpsc::Sender<GatewayMessage>,
    }

    fn config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        }
    }

    fn harness(config: SessionConfig, configure: impl FnOnce(&mut MockGatewayClient)) -> Harness {
        let (inbound, rx) = mpsc::channel(64);
        let mut gateway = MockGatewayClient::new();
        gateway
            .expect_open_session()
            .times(1)
            .return_once(move |_, _, _| Ok(rx));
        configure(&mut gateway);

        let publisher = Arc::new(RecordingPublisher::default());
        let manager = ConnectionManager::new(Arc::new(gateway), publisher.clone(), config);
        Harness {
            manager,
            publisher,
            inbound,
        }
    }

    async fn connected(configure: impl FnOnce(&mut MockGatewayClient)) -> Harness {
        let h = harness(config(), configure);
        h.inbound.send(GatewayMessage::ConnectAck).await.unwrap();
        h.manager.connect("127.0.0.1", 4002, 1).await.unwrap();
        h
    }

    fn status_events(publisher: &RecordingPublisher) -> Vec<LinkStatus> {
        publisher
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::ConnectionStatus { status } => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Gateway whose `open_session` never completes.
    #[derive(Default)]
    struct StalledGateway {
        closes: Mutex<usize>,
    }

    #[async_trait]
    impl GatewayClient for StalledGateway {
        async fn open_session(
            &self,
            _host: &str,
            _port: u16,
            _client_id: i32,
        ) -> Result<GatewayStream, TransportError> {
            std::future::pending().await
        }

        async fn close_session(&self) -> Result<(), TransportError> {
            *self.closes.lock() += 1;
            Ok(())
        }

        async fn request_market_data(
            &self,
            _request_id: RequestId,
            _contract: &ContractSpec,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn cancel_market_data(&self, _request_id: RequestId) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn settle(manager: &ConnectionManager, state: ConnectionState) {
        let mut changes = manager.state_changes();
        tokio::time::timeout(Duration::from_secs(1), changes.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn connect_ack_completes_handshake() {
        let h = connected(|_| {}).await;

        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert!(h.manager.status().connected);
        assert_eq!(status_events(&h.publisher), vec![LinkStatus::Connected]);
    }

    #[tokio::test]
    async fn connect_while_active_is_rejected() {
        let h = connected(|_| {}).await;

        let err = h.manager.connect("127.0.0.1", 4002, 1).await.unwrap_err();
        assert_eq!(err, ConnectionError::AlreadyActive("connected".to_string()));
    }

    #[tokio::test]
    async fn open_failure_returns_to_disconnected() {
        let mut gateway = MockGatewayClient::new();
        gateway.expect_open_session().returning(|host, port, _| {
            Err(TransportError::ConnectFailed {
                address: format!("{host}:{port}"),
                reason: "connection refused".to_string(),
            })
        });
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = ConnectionManager::new(Arc::new(gateway), publisher.clone(), config());

        let err = manager.connect("127.0.0.1", 4002, 1).await.unwrap_err();

        assert!(matches!(err, ConnectionError::Transport(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.log_history()[0].level, LogLevel::Error);
        assert!(status_events(&publisher).is_empty());
    }

    #[tokio::test]
    async fn callback_sequence_buffers_price_and_logs_volume() {
        let h = connected(|g| {
            g.expect_request_market_data().returning(|_, _| Ok(()));
        })
        .await;
        h.manager.next_valid_id(5);
        let request_id = h.manager.subscribe("AAPL").await.unwrap();
        assert_eq!(request_id, 5);

        let published_before = h.publisher.events.lock().len();
        h.manager.tick_price(request_id, 4, 101.20);
        h.manager.tick_size(request_id, 8, 500);

        let prices = h.manager.price_history();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].price_value(), Some(101.20));
        assert!(h.manager.log_history().len() >= 2);

        let names = h.publisher.names();
        assert_eq!(&names[published_before..], &["price_update", "log_update"]);
    }

    #[tokio::test]
    async fn unsolicited_close_publishes_disconnected_once() {
        let h = connected(|_| {}).await;

        h.inbound.send(GatewayMessage::ConnectionClosed).await.unwrap();
        settle(&h.manager, ConnectionState::Disconnected).await;
        h.manager.connection_closed();

        assert_eq!(
            status_events(&h.publisher),
            vec![LinkStatus::Connected, LinkStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn disconnect_when_disconnected_is_noop() {
        // No expectations: any gateway call panics.
        let gateway = MockGatewayClient::new();
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = ConnectionManager::new(Arc::new(gateway), publisher.clone(), config());

        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(publisher.events.lock().is_empty());
    }

    #[tokio::test]
    async fn disconnect_tears_down_session() {
        let h = connected(|g| {
            g.expect_close_session().times(1).returning(|| Ok(()));
        })
        .await;

        h.manager.disconnect().await;

        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            status_events(&h.publisher),
            vec![LinkStatus::Connected, LinkStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn handshake_timeout_closes_session() {
        let h = harness(config(), |g| {
            g.expect_close_session().times(1).returning(|| Ok(()));
        });

        let err = h.manager.connect("127.0.0.1", 4002, 1).await.unwrap_err();

        assert_eq!(err, ConnectionError::HandshakeTimeout(Duration::from_millis(200)));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(status_events(&h.publisher).is_empty());
        let last = h.manager.log_history().pop().unwrap();
        assert!(last.message.starts_with("Connection error:"));
    }

    #[tokio::test]
    async fn disconnect_during_connect_aborts_it() {
        let slow = SessionConfig {
            connect_timeout: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let h = harness(slow, |g| {
            g.expect_close_session().times(1).returning(|| Ok(()));
        });

        let manager = h.manager.clone();
        let pending = tokio::spawn(async move { manager.connect("127.0.0.1", 4002, 1).await });
        settle(&h.manager, ConnectionState::Connecting).await;

        h.manager.disconnect().await;

        assert_eq!(pending.await.unwrap(), Err(ConnectionError::Aborted));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(status_events(&h.publisher).is_empty());
    }

    #[tokio::test]
    async fn stalled_open_is_bounded_by_connect_timeout() {
        let gateway = Arc::new(StalledGateway::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = ConnectionManager::new(
            gateway.clone(),
            publisher.clone(),
            SessionConfig {
                connect_timeout: Duration::from_millis(100),
                ..SessionConfig::default()
            },
        );

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            manager.connect("127.0.0.1", 4002, 1),
        )
        .await
        .unwrap();

        assert_eq!(
            result,
            Err(ConnectionError::HandshakeTimeout(Duration::from_millis(100)))
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(*gateway.closes.lock(), 0);
        assert!(status_events(&publisher).is_empty());
        assert!(
            manager
                .log_history()
                .iter()
                .any(|e| e.level == LogLevel::Error && e.message.starts_with("Connection error"))
        );
    }

    #[tokio::test]
    async fn disconnect_cancels_stalled_open() {
        let gateway = Arc::new(StalledGateway::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = ConnectionManager::new(
            gateway.clone(),
            publisher.clone(),
            SessionConfig {
                connect_timeout: Duration::from_secs(30),
                ..SessionConfig::default()
            },
        );

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect("127.0.0.1", 4002, 1).await }
        });
        settle(&manager, ConnectionState::Connecting).await;

        tokio::time::timeout(Duration::from_secs(2), manager.disconnect())
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result, Err(ConnectionError::Aborted));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(*gateway.closes.lock(), 0);
        assert!(status_events(&publisher).is_empty());
    }

    #[tokio::test]
    async fn fatal_error_forces_disconnect() {
        let h = connected(|g| {
            g.expect_close_session().returning(|| Ok(()));
        })
        .await;

        h.inbound
            .send(GatewayMessage::Error {
                request_id: -1,
                code: 1300,
                text: "TWS socket port has been reset".to_string(),
            })
            .await
            .unwrap();
        settle(&h.manager, ConnectionState::Disconnected).await;

        assert_eq!(
            status_events(&h.publisher),
            vec![LinkStatus::Connected, LinkStatus::Disconnected]
        );
        assert!(
            h.manager
                .log_history()
                .iter()
                .any(|e| e.message == "Error 1300: TWS socket port has been reset")
        );
    }

    #[tokio::test]
    async fn failed_close_after_fatal_error_is_journaled() {
        let h = connected(|g| {
            g.expect_close_session()
                .returning(|| Err(TransportError::NotConnected));
        })
        .await;

        h.inbound
            .send(GatewayMessage::Error {
                request_id: -1,
                code: 504,
                text: "Not connected".to_string(),
            })
            .await
            .unwrap();
        settle(&h.manager, ConnectionState::Disconnected).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while !h.manager.log_history().iter().any(|e| {
                e.level == LogLevel::Error && e.message.starts_with("Close after fatal error failed")
            }) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn non_fatal_error_keeps_session() {
        let h = connected(|_| {}).await;

        assert!(!h.manager.error(3, 200, "No security definition has been found"));
        assert!(!h.manager.error(-1, 2104, "Market data farm connection is OK"));

        let logs = h.manager.log_history();
        let levels: Vec<_> = logs.iter().rev().take(2).map(|e| e.level).collect();
        assert_eq!(levels, vec![LogLevel::Info, LogLevel::Error]);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn subscribe_when_disconnected_leaves_allocator_unchanged() {
        let gateway = MockGatewayClient::new();
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = ConnectionManager::new(Arc::new(gateway), publisher.clone(), config());

        let err = manager.subscribe("AAPL").await.unwrap_err();

        assert!(matches!(err, SubscriptionError::NotConnected { .. }));
        assert_eq!(manager.next_request_id(), 1);
        assert_eq!(manager.log_history()[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn resubscribe_drops_stale_ticks_and_history() {
        let h = connected(|g| {
            g.expect_request_market_data().returning(|_, _| Ok(()));
            g.expect_cancel_market_data().returning(|_| Ok(()));
        })
        .await;

        let old = h.manager.subscribe("AAPL").await.unwrap();
        h.manager.tick_price(old, 4, 190.0);
        assert_eq!(h.manager.status().buffered_points, 1);

        let new = h.manager.subscribe("msft").await.unwrap();
        assert!(new > old);
        assert_eq!(h.manager.status().buffered_points, 0);

        h.manager.tick_price(old, 4, 191.0);
        h.manager.tick_price(new, 4, 410.0);

        let prices = h.manager.price_history();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].symbol, "MSFT");
        assert_eq!(h.manager.status().symbol.as_deref(), Some("MSFT"));
    }

    #[tokio::test]
    async fn close_clears_subscription_symbol() {
        let h = connected(|g| {
            g.expect_request_market_data().returning(|_, _| Ok(()));
        })
        .await;
        h.manager.subscribe("AAPL").await.unwrap();

        h.inbound.send(GatewayMessage::ConnectionClosed).await.unwrap();
        settle(&h.manager, ConnectionState::Disconnected).await;

        assert!(h.manager.status().symbol.is_none());
    }
}
