//! Live broker: the dispatch loop that connects a venue stream to the
//! order registry.
//!
//! Startup is strictly ordered (balances, then pre-existing open orders,
//! then the stream) so no venue event can reference an order the registry
//! has not seen yet.

mod broker;
mod error;

pub use broker::{LiveBroker, DISPATCH_WAIT};
pub use error::BrokerError;
