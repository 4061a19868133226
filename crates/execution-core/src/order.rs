//! Order types and the per-order state machine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::execution::ExecutionInfo;

/// Venue-assigned order id.
pub type OrderId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn from_binance_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn as_binance_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// What the caller asked for. Spot venues have no short book, so the
/// cover/short variants collapse onto plain buy/sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    BuyToCover,
    Sell,
    SellShort,
}

impl OrderAction {
    pub fn side(self) -> OrderSide {
        match self {
            Self::Buy | Self::BuyToCover => OrderSide::Buy,
            Self::Sell | Self::SellShort => OrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn from_binance_str(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Self::Market),
            "LIMIT" | "LIMIT_MAKER" => Some(Self::Limit),
            "STOP_LOSS" | "TAKE_PROFIT" => Some(Self::Stop),
            "STOP_LOSS_LIMIT" | "TAKE_PROFIT_LIMIT" => Some(Self::StopLimit),
            _ => None,
        }
    }

    pub fn as_binance_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Stop => "STOP_LOSS",
            Self::StopLimit => "STOP_LOSS_LIMIT",
        }
    }

    /// Whether orders of this type can be placed through the registry.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Market | Self::Limit)
    }
}

/// Lifecycle state.
///
/// `Initial → Submitted → Accepted → PartiallyFilled* → Filled | Canceled | Rejected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Initial,
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    /// Maps a Binance order status. `PENDING_CANCEL` and unknown values carry
    /// no state change and return `None`.
    pub fn from_binance_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::Accepted),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    /// Submitted to the venue and not yet finished.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Accepted | Self::PartiallyFilled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::Submitted => 1,
            Self::Accepted => 2,
            Self::PartiallyFilled => 3,
            Self::Filled | Self::Canceled | Self::Rejected => 4,
        }
    }

    /// True if `next` would move the order backwards (e.g. a late `Accepted`
    /// after `PartiallyFilled`).
    pub fn is_regression(&self, next: OrderState) -> bool {
        next.rank() < self.rank()
    }

    pub fn can_transition_to(&self, next: OrderState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Initial => false,
            Self::Submitted => *self == Self::Initial,
            // Further partial fills keep the order in PartiallyFilled.
            Self::PartiallyFilled => matches!(
                self,
                Self::Submitted | Self::Accepted | Self::PartiallyFilled
            ),
            _ => *self != Self::Initial && next.rank() > self.rank(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Canceled.
    GTC,
    /// Immediate Or Cancel.
    IOC,
    /// Fill Or Kill.
    FOK,
}

impl TimeInForce {
    pub fn from_binance_str(s: &str) -> Option<Self> {
        match s {
            "GTC" => Some(Self::GTC),
            "IOC" => Some(Self::IOC),
            "FOK" => Some(Self::FOK),
            _ => None,
        }
    }

    pub fn as_binance_str(&self) -> &'static str {
        match self {
            Self::GTC => "GTC",
            Self::IOC => "IOC",
            Self::FOK => "FOK",
        }
    }
}

/// An order tracked by the system.
///
/// Callers hold copies; the [`OrderRegistry`](crate::OrderRegistry) holds the
/// authoritative one and is the only thing that mutates it after submission.
/// `filled` always equals the sum of `executions` sizes and never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    id: Option<OrderId>,
    symbol: String,
    action: OrderAction,
    order_type: OrderType,
    price: Option<Decimal>,
    stop_price: Option<Decimal>,
    quantity: Decimal,
    time_in_force: Option<TimeInForce>,
    state: OrderState,
    filled: Decimal,
    fee: Decimal,
    executions: Vec<ExecutionInfo>,
}

impl Order {
    fn new(
        symbol: impl Into<String>,
        action: OrderAction,
        order_type: OrderType,
        price: Option<Decimal>,
        quantity: Decimal,
    ) -> Self {
        Self {
            id: None,
            symbol: symbol.into(),
            action,
            order_type,
            price,
            stop_price: None,
            quantity,
            time_in_force: (order_type == OrderType::Limit).then_some(TimeInForce::GTC),
            state: OrderState::Initial,
            filled: Decimal::ZERO,
            fee: Decimal::ZERO,
            executions: Vec::new(),
        }
    }

    /// A good-till-canceled limit order in `Initial` state.
    pub fn limit(
        action: OrderAction,
        symbol: impl Into<String>,
        price: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self::new(symbol, action, OrderType::Limit, Some(price), quantity)
    }

    pub fn market(action: OrderAction, symbol: impl Into<String>, quantity: Decimal) -> Self {
        Self::new(symbol, action, OrderType::Market, None, quantity)
    }

    /// Stop orders can be described but not placed.
    pub fn stop(
        action: OrderAction,
        symbol: impl Into<String>,
        stop_price: Decimal,
        quantity: Decimal,
    ) -> Self {
        let mut order = Self::new(symbol, action, OrderType::Stop, None, quantity);
        order.stop_price = Some(stop_price);
        order
    }

    pub fn stop_limit(
        action: OrderAction,
        symbol: impl Into<String>,
        stop_price: Decimal,
        limit_price: Decimal,
        quantity: Decimal,
    ) -> Self {
        let mut order = Self::new(symbol, action, OrderType::StopLimit, Some(limit_price), quantity);
        order.stop_price = Some(stop_price);
        order
    }

    /// Rebuilds an order that was already open at the venue.
    ///
    /// Prior fills are carried as one execution at their average price so
    /// `filled` stays equal to the sum of executions.
    pub fn restored(
        id: OrderId,
        symbol: impl Into<String>,
        side: OrderSide,
        order_type: OrderType,
        price: Option<Decimal>,
        quantity: Decimal,
        prior_fill: Option<ExecutionInfo>,
    ) -> Self {
        let action = match side {
            OrderSide::Buy => OrderAction::Buy,
            OrderSide::Sell => OrderAction::Sell,
        };
        let mut order = Self::new(symbol, action, order_type, price, quantity);
        order.id = Some(id);
        order.state = OrderState::Accepted;
        if let Some(fill) = prior_fill.filter(|f| f.size > Decimal::ZERO) {
            order.filled = fill.size;
            order.fee = fill.fee;
            order.executions.push(fill);
            order.state = OrderState::PartiallyFilled;
        }
        order
    }

    pub fn id(&self) -> Option<OrderId> {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn action(&self) -> OrderAction {
        self.action
    }

    pub fn side(&self) -> OrderSide {
        self.action.side()
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    /// Limit price; `None` for market orders.
    pub fn price(&self) -> Option<Decimal> {
        self.price
    }

    pub fn stop_price(&self) -> Option<Decimal> {
        self.stop_price
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn time_in_force(&self) -> Option<TimeInForce> {
        self.time_in_force
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn filled(&self) -> Decimal {
        self.filled
    }

    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled
    }

    pub fn fee(&self) -> Decimal {
        self.fee
    }

    pub fn executions(&self) -> &[ExecutionInfo] {
        &self.executions
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Whether the whole quantity has been executed.
    pub fn is_fully_filled(&self) -> bool {
        self.filled >= self.quantity
    }

    /// Volume-weighted fill price.
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        if self.filled.is_zero() {
            return None;
        }
        let notional: Decimal = self.executions.iter().map(|e| e.price * e.size).sum();
        Some(notional / self.filled)
    }

    /// Whether an execution for this venue trade id was already recorded.
    pub fn has_trade(&self, trade_id: u64) -> bool {
        self.executions.iter().any(|e| e.trade_id == Some(trade_id))
    }

    pub(crate) fn set_id(&mut self, id: OrderId) {
        self.id = Some(id);
    }

    pub(crate) fn set_price(&mut self, price: Option<Decimal>) {
        self.price = price;
    }

    pub(crate) fn set_quantity(&mut self, quantity: Decimal) {
        self.quantity = quantity;
    }

    pub(crate) fn switch_state(&mut self, next: OrderState) -> Result<(), ExecutionError> {
        if !self.state.can_transition_to(next) {
            return Err(ExecutionError::InvariantViolation(format!(
                "order {:?}: illegal transition {:?} -> {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn add_execution(&mut self, execution: ExecutionInfo) -> Result<(), ExecutionError> {
        if execution.size <= Decimal::ZERO {
            return Err(ExecutionError::InvariantViolation(format!(
                "order {:?}: non-positive execution size {}",
                self.id, execution.size
            )));
        }
        if self.filled + execution.size > self.quantity {
            return Err(ExecutionError::InvariantViolation(format!(
                "order {:?}: execution of {} overfills {} of {}",
                self.id, execution.size, self.filled, self.quantity
            )));
        }
        self.filled += execution.size;
        self.fee += execution.fee;
        self.executions.push(execution);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn exec(size: Decimal) -> ExecutionInfo {
        ExecutionInfo::new(dec!(100), size, Decimal::ZERO, Utc::now())
    }

    #[test]
    fn test_action_aliases() {
        assert_eq!(OrderAction::BuyToCover.side(), OrderSide::Buy);
        assert_eq!(OrderAction::SellShort.side(), OrderSide::Sell);
    }

    #[test]
    fn test_binance_status_mapping() {
        assert_eq!(OrderState::from_binance_str("NEW"), Some(OrderState::Accepted));
        assert_eq!(OrderState::from_binance_str("EXPIRED"), Some(OrderState::Canceled));
        assert_eq!(OrderState::from_binance_str("PENDING_CANCEL"), None);
        assert_eq!(OrderType::from_binance_str("STOP_LOSS_LIMIT"), Some(OrderType::StopLimit));
        assert_eq!(OrderSide::from_binance_str("SELL"), Some(OrderSide::Sell));
    }

    #[test]
    fn test_transitions() {
        use OrderState::*;
        assert!(Initial.can_transition_to(Submitted));
        assert!(!Initial.can_transition_to(Accepted));
        assert!(Submitted.can_transition_to(Accepted));
        assert!(Submitted.can_transition_to(Filled));
        assert!(Accepted.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(PartiallyFilled));
        assert!(!PartiallyFilled.can_transition_to(Accepted));
        assert!(!Accepted.can_transition_to(Submitted));
        for terminal in [Filled, Canceled, Rejected] {
            for next in [Submitted, Accepted, PartiallyFilled, Filled, Canceled, Rejected] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(PartiallyFilled.is_regression(Accepted));
        assert!(!Accepted.is_regression(PartiallyFilled));
    }

    #[test]
    fn test_limit_orders_are_gtc() {
        let order = Order::limit(OrderAction::Buy, "BTCUSDT", dec!(100), dec!(1));
        assert_eq!(order.time_in_force(), Some(TimeInForce::GTC));
        assert_eq!(order.state(), OrderState::Initial);
        assert!(order.id().is_none());
        assert!(Order::market(OrderAction::Sell, "BTCUSDT", dec!(1))
            .time_in_force()
            .is_none());
    }

    #[test]
    fn test_executions_accumulate() {
        let mut order = Order::limit(OrderAction::Buy, "BTCUSDT", dec!(100), dec!(1));
        order.add_execution(exec(dec!(0.4))).unwrap();
        order.add_execution(ExecutionInfo::new(dec!(110), dec!(0.6), dec!(0.1), Utc::now()))
            .unwrap();

        assert_eq!(order.filled(), dec!(1.0));
        assert_eq!(order.fee(), dec!(0.1));
        assert!(order.is_fully_filled());
        assert_eq!(order.avg_fill_price(), Some(dec!(106)));
        let sum: Decimal = order.executions().iter().map(|e| e.size).sum();
        assert_eq!(sum, order.filled());
    }

    #[test]
    fn test_overfill_rejected() {
        let mut order = Order::limit(OrderAction::Buy, "BTCUSDT", dec!(100), dec!(1));
        order.add_execution(exec(dec!(0.8))).unwrap();
        assert!(matches!(
            order.add_execution(exec(dec!(0.3))),
            Err(ExecutionError::InvariantViolation(_))
        ));
        assert!(order.add_execution(exec(dec!(0))).is_err());
        assert_eq!(order.filled(), dec!(0.8));
    }

    #[test]
    fn test_restored_order_keeps_prior_fill() {
        let prior = ExecutionInfo::new(dec!(100), dec!(0.25), Decimal::ZERO, Utc::now());
        let order = Order::restored(
            9,
            "BTCUSDT",
            OrderSide::Sell,
            OrderType::Limit,
            Some(dec!(100)),
            dec!(1),
            Some(prior),
        );
        assert_eq!(order.id(), Some(9));
        assert_eq!(order.state(), OrderState::PartiallyFilled);
        assert_eq!(order.filled(), dec!(0.25));
        assert_eq!(order.action(), OrderAction::Sell);
    }
}
