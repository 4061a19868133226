//! Order execution for a single trading pair.
//!
//! - **Order types**: [`Order`], [`OrderAction`], [`OrderSide`], [`OrderType`],
//!   [`OrderState`], [`TimeInForce`]
//! - **Venue input**: [`TradeMatch`] and [`OrderStatusChange`], carried to the
//!   dispatch loop as [`BrokerMessage`]
//! - **Output**: [`OrderEvent`] on an unbounded channel
//! - **Reconciler**: [`OrderRegistry`], the single writer of order state
//! - **Venue access**: the [`VenueGateway`] trait
//!
//! # Order Lifecycle
//!
//! 1. Caller creates an order through the registry (instrument checked)
//! 2. `submit` places it; the venue id comes back synchronously
//! 3. The order is registered and a `Submitted` event is emitted
//! 4. Status pushes and trade matches advance it
//! 5. On a terminal state it is unregistered and balances are refreshed

mod error;
mod execution;
mod fees;
mod gateway;
mod order;
mod registry;

pub use error::ExecutionError;
pub use execution::{
    timestamp_from_millis, BrokerMessage, CumulativeFill, ExecutionInfo, OrderEvent, OrderEventKind,
    OrderStatusChange, TradeMatch,
};
pub use fees::FeeSchedule;
pub use gateway::{GatewayError, VenueGateway};
pub use order::{Order, OrderAction, OrderId, OrderSide, OrderState, OrderType, TimeInForce};
pub use registry::{
    create_order_event_channel, OrderEventReceiver, OrderEventSender, OrderRegistry, FETCH_RETRIES,
};
