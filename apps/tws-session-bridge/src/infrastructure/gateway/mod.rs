//! Gateway Adapters
//!
//! Implementations of the [`GatewayClient`](crate::application::ports::GatewayClient)
//! port.
//!
//! - [`BridgeGateway`] talks JSON over a WebSocket to a bridge sidecar that
//!   holds the native gateway API session.
//! - [`SimulatedGateway`] answers the handshake in process and streams a
//!   random-walk price, for local runs and tests.

mod bridge;
mod codec;
mod messages;
mod simulated;

pub use bridge::{BridgeGateway, BridgeGatewayConfig};
pub use codec::{BridgeCodec, CodecError, FrameResult};
pub use messages::{BridgeCommand, BridgeFrame};
pub use simulated::{GatewayCall, SimulatedGateway, SimulatorConfig};
