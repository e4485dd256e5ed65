//! Gateway Bridge Wire Messages
//!
//! JSON frames exchanged with the gateway bridge sidecar. Inbound frames are
//! tagged by `type`, outbound commands by `action`. Inbound types the session
//! has no use for (`tick_string`, `tick_generic`, ...) decode as
//! [`BridgeFrame::Unsupported`] and are dropped.
//!
//! ```json
//! {"type":"tick_price","req_id":3,"tick_type":4,"price":101.2}
//! {"action":"req_mkt_data","req_id":3,"symbol":"AAPL","sec_type":"STK","exchange":"SMART","currency":"USD"}
//! ```

use serde::{Deserialize, Serialize};

use crate::application::ports::GatewayMessage;
use crate::domain::market_data::{ContractSpec, RequestId};

// =============================================================================
// Inbound Frames
// =============================================================================

/// Frame received from the gateway bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    /// Handshake acknowledged.
    ConnectAck,
    /// Gateway session closed.
    ConnectionClosed,
    /// Error notice.
    Error {
        /// Request the error refers to.
        #[serde(default = "no_request")]
        req_id: RequestId,
        /// Gateway error code.
        code: i32,
        /// Error text.
        #[serde(default)]
        message: String,
    },
    /// Price tick.
    TickPrice {
        /// Request the tick belongs to.
        req_id: RequestId,
        /// Raw tick code.
        tick_type: i32,
        /// Price.
        price: f64,
    },
    /// Size tick.
    TickSize {
        /// Request the tick belongs to.
        req_id: RequestId,
        /// Raw tick code.
        tick_type: i32,
        /// Size.
        size: i64,
    },
    /// Lowest accepted request identifier.
    NextValidId {
        /// Identifier.
        order_id: RequestId,
    },
    /// Any other frame type.
    #[serde(other)]
    Unsupported,
}

const fn no_request() -> RequestId {
    -1
}

impl BridgeFrame {
    /// The session message this frame carries, if any.
    #[must_use]
    pub fn into_message(self) -> Option<GatewayMessage> {
        let message = match self {
            Self::ConnectAck => GatewayMessage::ConnectAck,
            Self::ConnectionClosed => GatewayMessage::ConnectionClosed,
            Self::Error {
                req_id,
                code,
                message,
            } => GatewayMessage::Error {
                request_id: req_id,
                code,
                text: message,
            },
            Self::TickPrice {
                req_id,
                tick_type,
                price,
            } => GatewayMessage::TickPrice {
                request_id: req_id,
                tick_type,
                price,
            },
            Self::TickSize {
                req_id,
                tick_type,
                size,
            } => GatewayMessage::TickSize {
                request_id: req_id,
                tick_type,
                size,
            },
            Self::NextValidId { order_id } => GatewayMessage::NextValidId(order_id),
            Self::Unsupported => return None,
        };
        Some(message)
    }
}

// =============================================================================
// Outbound Commands
// =============================================================================

/// Command sent to the gateway bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BridgeCommand {
    /// Start the API session.
    StartApi {
        /// API client identifier.
        client_id: i32,
    },
    /// Request streaming market data.
    ReqMktData {
        /// Request identifier.
        req_id: RequestId,
        /// Ticker symbol.
        symbol: String,
        /// Security type.
        sec_type: String,
        /// Routing exchange.
        exchange: String,
        /// Currency.
        currency: String,
    },
    /// Cancel streaming market data.
    CancelMktData {
        /// Request identifier.
        req_id: RequestId,
    },
    /// End the API session.
    Disconnect,
}

impl BridgeCommand {
    /// Build a market data request for `contract`.
    #[must_use]
    pub fn request(req_id: RequestId, contract: &ContractSpec) -> Self {
        Self::ReqMktData {
            req_id,
            symbol: contract.symbol.clone(),
            sec_type: contract.security_type.clone(),
            exchange: contract.exchange.clone(),
            currency: contract.currency.clone(),
        }
    }
}
