//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `EventJournal`: Structured user-facing log with bounded history
//! - `TickDispatcher`: Classifies ticks and publishes observable prices
//! - `SubscriptionRegistry`: Single active subscription, cancel-before-subscribe
//! - `ConnectionManager`: Session state machine and read loop

mod dispatcher;
mod journal;
mod registry;
mod session;

pub use dispatcher::{DEFAULT_PRICE_WINDOW, Dispatch, DispatcherConfig, TickDispatcher};
pub use journal::EventJournal;
pub use registry::{SubscriptionReceipt, SubscriptionRegistry};
pub use session::{ConnectionManager, DEFAULT_CONNECT_TIMEOUT, SessionConfig};
