//! Fills, venue pushes and the lifecycle events emitted to observers.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::order::{Order, OrderId, OrderState};

/// Venue millisecond timestamp as UTC. Out-of-range values map to now.
pub fn timestamp_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// One fill. Appended to an order, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Venue trade id, used to recognise the same fill arriving twice.
    pub trade_id: Option<u64>,
}

impl ExecutionInfo {
    pub fn new(price: Decimal, size: Decimal, fee: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            price,
            size,
            fee,
            timestamp,
            trade_id: None,
        }
    }

    pub fn with_trade_id(mut self, trade_id: u64) -> Self {
        self.trade_id = Some(trade_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventKind {
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    /// Also used for venue-side rejections.
    Canceled,
}

impl OrderEventKind {
    /// Event emitted when an order enters `state`.
    pub fn for_state(state: OrderState) -> Option<Self> {
        match state {
            OrderState::Initial => None,
            OrderState::Submitted => Some(Self::Submitted),
            OrderState::Accepted => Some(Self::Accepted),
            OrderState::PartiallyFilled => Some(Self::PartiallyFilled),
            OrderState::Filled => Some(Self::Filled),
            OrderState::Canceled | OrderState::Rejected => Some(Self::Canceled),
        }
    }
}

/// Lifecycle notification. `order` is a copy taken after the transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order: Order,
    pub kind: OrderEventKind,
    pub execution: Option<ExecutionInfo>,
}

/// An exchange-reported trade that may involve our orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeMatch {
    /// Venue trade id.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub size: Decimal,
    pub buyer_order_id: Option<OrderId>,
    pub seller_order_id: Option<OrderId>,
}

impl TradeMatch {
    /// Distinct order ids referenced by the match.
    pub fn order_ids(&self) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self
            .buyer_order_id
            .into_iter()
            .chain(self.seller_order_id)
            .collect();
        ids.dedup();
        ids
    }
}

/// Fill information carried by an order-status push.
///
/// Venues report the cumulative executed quantity; the registry turns the
/// part it has not accounted for yet into an [`ExecutionInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeFill {
    pub price: Decimal,
    pub cumulative_filled: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
    pub trade_id: Option<u64>,
}

/// A venue order-status push, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusChange {
    pub order_id: OrderId,
    /// `None` when the push carries no state change.
    pub new_state: Option<OrderState>,
    pub fill: Option<CumulativeFill>,
    pub event_time_ms: i64,
}

/// Messages drained by the dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerMessage {
    TradeMatch(TradeMatch),
    StatusChange(OrderStatusChange),
}
