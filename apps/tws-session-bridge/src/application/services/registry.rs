//! Subscription Registry
//!
//! Tracks the single active symbol-to-request mapping and enforces
//! cancel-before-subscribe against the gateway.
//!
//! # Ordering
//!
//! `subscribe` detaches the previous record, cancels its request, and only
//! then allocates a new identifier and requests data for the new symbol. The
//! new record is installed before the request goes out so the first tick
//! cannot race past it; if the request fails, the record is removed again.

use std::sync::Arc;

use crate::application::ports::GatewayClient;
use crate::domain::market_data::{
    ConnectionState, ContractSpec, RequestId, Subscription, normalize_symbol,
};
use crate::domain::subscription::{RequestIdAllocator, SubscriptionError, SubscriptionSlot};
use crate::infrastructure::metrics;

/// Result of a successful `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionReceipt {
    /// Identifier of the new request.
    pub request_id: RequestId,
    /// Normalized symbol.
    pub symbol: String,
    /// The previous subscription that was replaced.
    pub replaced: Option<Subscription>,
    /// Set when cancelling the previous request failed.
    pub cancel_failure: Option<SubscriptionError>,
}

/// Owner of the active subscription and the request id sequence.
pub struct SubscriptionRegistry {
    slot: SubscriptionSlot,
    allocator: Arc<RequestIdAllocator>,
    gateway: Arc<dyn GatewayClient>,
    template: ContractSpec,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active", &self.slot.current())
            .field("next_request_id", &self.allocator.peek())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry.
    ///
    /// `template` supplies the security type, exchange and currency for every
    /// requested contract; its symbol is replaced per request.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn GatewayClient>,
        allocator: Arc<RequestIdAllocator>,
        template: ContractSpec,
    ) -> Self {
        Self {
            slot: SubscriptionSlot::new(),
            allocator,
            gateway,
            template,
        }
    }

    /// Replace the active subscription with one for `symbol`.
    ///
    /// `on_detached` runs once the previous record is detached and before any
    /// gateway call; the session uses it to drop stale price history.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::NotConnected`] without touching the
    /// gateway or the allocator unless `state` is connected,
    /// [`SubscriptionError::InvalidSymbol`] for blank symbols, and
    /// [`SubscriptionError::RequestFailed`] if the gateway request fails.
    pub async fn subscribe(
        &self,
        symbol: &str,
        state: ConnectionState,
        on_detached: impl FnOnce() + Send,
    ) -> Result<SubscriptionReceipt, SubscriptionError> {
        if !state.is_connected() {
            return Err(SubscriptionError::NotConnected {
                state: state.to_string(),
            });
        }

        let symbol = normalize_symbol(symbol)
            .ok_or_else(|| SubscriptionError::InvalidSymbol(symbol.to_string()))?;

        let replaced = self.slot.take();
        on_detached();

        let cancel_failure = match &replaced {
            Some(previous) => self
                .gateway
                .cancel_market_data(previous.request_id)
                .await
                .err()
                .map(|e| SubscriptionError::CancelFailed {
                    request_id: previous.request_id,
                    reason: e.to_string(),
                }),
            None => None,
        };

        let request_id = self.allocator.next();
        let contract = ContractSpec {
            symbol: symbol.clone(),
            ..self.template.clone()
        };

        self.slot.replace(Subscription {
            request_id,
            contract: contract.clone(),
        });

        if let Err(e) = self.gateway.request_market_data(request_id, &contract).await {
            self.slot.take_if(request_id);
            return Err(SubscriptionError::RequestFailed {
                symbol,
                reason: e.to_string(),
            });
        }

        metrics::record_subscription();
        tracing::debug!(symbol = %symbol, request_id, "Market data requested");

        Ok(SubscriptionReceipt {
            request_id,
            symbol,
            replaced,
            cancel_failure,
        })
    }

    /// Cancel the active subscription, if any.
    ///
    /// The local record is cleared whether or not the gateway call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::CancelFailed`] if the gateway call failed.
    pub async fn cancel(&self) -> Result<Option<Subscription>, SubscriptionError> {
        let Some(previous) = self.slot.take() else {
            return Ok(None);
        };

        self.gateway
            .cancel_market_data(previous.request_id)
            .await
            .map_err(|e| SubscriptionError::CancelFailed {
                request_id: previous.request_id,
                reason: e.to_string(),
            })?;

        Ok(Some(previous))
    }

    /// Drop the local record without a gateway call.
    ///
    /// Used when the session is gone and the gateway has already forgotten
    /// the request.
    pub fn clear_local(&self) -> Option<Subscription> {
        self.slot.take()
    }

    /// Run `f` with the active subscription if it matches `request_id`.
    pub fn route<R>(&self, request_id: RequestId, f: impl FnOnce(&Subscription) -> R) -> Option<R> {
        self.slot.route(request_id, f)
    }

    /// Copy of the active subscription.
    #[must_use]
    pub fn current(&self) -> Option<Subscription> {
        self.slot.current()
    }

    /// Symbol of the active subscription.
    #[must_use]
    pub fn symbol(&self) -> Option<String> {
        self.slot.current().map(|s| s.contract.symbol)
    }
}

#[cfg(test)]
mod tests {
    use mockall::Sequence;
    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::{MockGatewayClient, TransportError};

    fn registry(gateway: MockGatewayClient) -> (SubscriptionRegistry, Arc<RequestIdAllocator>) {
        let allocator = Arc::new(RequestIdAllocator::new(1));
        let registry = SubscriptionRegistry::new(
            Arc::new(gateway),
            allocator.clone(),
            ContractSpec::stock(""),
        );
        (registry, allocator)
    }

    #[tokio::test]
    async fn not_connected_makes_no_gateway_call() {
        let mut gateway = MockGatewayClient::new();
        gateway.expect_request_market_data().never();
        gateway.expect_cancel_market_data().never();
        let (registry, allocator) = registry(gateway);

        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Disconnecting,
        ] {
            let err = registry.subscribe("AAPL", state, || {}).await.unwrap_err();
            assert!(matches!(err, SubscriptionError::NotConnected { .. }));
        }

        assert_eq!(allocator.peek(), 1);
        assert!(registry.current().is_none());
    }

    #[tokio::test]
    async fn blank_symbol_is_rejected() {
        let mut gateway = MockGatewayClient::new();
        gateway.expect_request_market_data().never();
        let (registry, allocator) = registry(gateway);

        let err = registry
            .subscribe("  ", ConnectionState::Connected, || {})
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::InvalidSymbol(_)));
        assert_eq!(allocator.peek(), 1);
    }

    #[tokio::test]
    async fn resubscribe_cancels_before_requesting() {
        let mut seq = Sequence::new();
        let mut gateway = MockGatewayClient::new();
        gateway
            .expect_request_market_data()
            .withf(|id, c| *id == 1 && c.symbol == "AAPL")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        gateway
            .expect_cancel_market_data()
            .with(eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        gateway
            .expect_request_market_data()
            .withf(|id, c| *id == 2 && c.symbol == "MSFT")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        let (registry, _) = registry(gateway);

        let first = registry
            .subscribe("aapl", ConnectionState::Connected, || {})
            .await
            .unwrap();
        assert_eq!(first.request_id, 1);
        assert_eq!(first.symbol, "AAPL");

        let second = registry
            .subscribe("MSFT", ConnectionState::Connected, || {})
            .await
            .unwrap();
        assert_eq!(second.request_id, 2);
        assert_eq!(second.replaced.unwrap().request_id, 1);
        assert_eq!(registry.symbol().as_deref(), Some("MSFT"));
    }

    #[tokio::test]
    async fn cancel_failure_does_not_block_new_subscription() {
        let mut gateway = MockGatewayClient::new();
        gateway
            .expect_request_market_data()
            .times(2)
            .returning(|_, _| Ok(()));
        gateway
            .expect_cancel_market_data()
            .returning(|_| Err(TransportError::SendFailed("broken pipe".to_string())));
        let (registry, _) = registry(gateway);

        registry
            .subscribe("AAPL", ConnectionState::Connected, || {})
            .await
            .unwrap();
        let receipt = registry
            .subscribe("MSFT", ConnectionState::Connected, || {})
            .await
            .unwrap();

        assert!(matches!(
            receipt.cancel_failure,
            Some(SubscriptionError::CancelFailed { request_id: 1, .. })
        ));
        assert_eq!(registry.current().unwrap().request_id, 2);
    }

    #[tokio::test]
    async fn failed_request_clears_record() {
        let mut gateway = MockGatewayClient::new();
        gateway
            .expect_request_market_data()
            .returning(|_, _| Err(TransportError::NotConnected));
        let (registry, _) = registry(gateway);

        let err = registry
            .subscribe("AAPL", ConnectionState::Connected, || {})
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::RequestFailed { .. }));
        assert!(registry.current().is_none());
    }

    #[tokio::test]
    async fn detach_hook_runs_before_gateway_calls() {
        let mut gateway = MockGatewayClient::new();
        gateway.expect_request_market_data().returning(|_, _| Ok(()));
        let (registry, _) = registry(gateway);

        let mut detached = false;
        registry
            .subscribe("AAPL", ConnectionState::Connected, || detached = true)
            .await
            .unwrap();

        assert!(detached);
    }

    #[tokio::test]
    async fn cancel_without_subscription_is_noop() {
        let mut gateway = MockGatewayClient::new();
        gateway.expect_cancel_market_data().never();
        let (registry, _) = registry(gateway);

        assert_eq!(registry.cancel().await, Ok(None));
    }

    #[tokio::test]
    async fn cancel_clears_record_even_on_failure() {
        let mut gateway = MockGatewayClient::new();
        gateway.expect_request_market_data().returning(|_, _| Ok(()));
        gateway
            .expect_cancel_market_data()
            .with(eq(1))
            .returning(|_| Err(TransportError::NotConnected));
        let (registry, _) = registry(gateway);

        registry
            .subscribe("AAPL", ConnectionState::Connected, || {})
            .await
            .unwrap();

        assert!(registry.cancel().await.is_err());
        assert!(registry.current().is_none());
    }
}
