//! Order lifecycle reconciler.
//!
//! The registry owns the authoritative copy of every active order and is the
//! only writer of order state. It is driven from a single task: `submit` and
//! `cancel` by the caller, `on_trade_match` and `on_status_change` by the
//! dispatch loop. Every mutator takes `&mut self`, so no locking is needed.
//!
//! Events are emitted after the state switch and after (un)registration, one
//! per transition.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use common::ExponentialBackoff;
use model::{InstrumentTraits, TradingPair};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Span};

use crate::error::ExecutionError;
use crate::execution::{ExecutionInfo, OrderEvent, OrderEventKind, OrderStatusChange, TradeMatch};
use crate::fees::FeeSchedule;
use crate::gateway::{GatewayError, VenueGateway};
use crate::order::{Order, OrderAction, OrderId, OrderState, OrderType};

pub type OrderEventSender = mpsc::UnboundedSender<OrderEvent>;
pub type OrderEventReceiver = mpsc::UnboundedReceiver<OrderEvent>;

/// Retries for a transient balance or open-order fetch before it is escalated.
pub const FETCH_RETRIES: u32 = 3;

/// Creates the channel the registry publishes lifecycle events on.
pub fn create_order_event_channel() -> (OrderEventSender, OrderEventReceiver) {
    mpsc::unbounded_channel()
}

pub struct OrderRegistry {
    gateway: Arc<dyn VenueGateway>,
    pair: TradingPair,
    symbol: String,
    traits: InstrumentTraits,
    fees: FeeSchedule,
    active: HashMap<OrderId, Order>,
    balances: HashMap<String, Decimal>,
    cash: Decimal,
    shares: Decimal,
    events: OrderEventSender,
    fetch_backoff: ExponentialBackoff,
    fetch_retries: u32,
    span: Span,
}

impl OrderRegistry {
    pub fn new(
        gateway: Arc<dyn VenueGateway>,
        pair: TradingPair,
        traits: InstrumentTraits,
        events: OrderEventSender,
        span: Span,
    ) -> Self {
        let symbol = pair.symbol();
        Self {
            gateway,
            pair,
            symbol,
            traits,
            fees: FeeSchedule::default(),
            active: HashMap::new(),
            balances: HashMap::new(),
            cash: Decimal::ZERO,
            shares: Decimal::ZERO,
            events,
            fetch_backoff: ExponentialBackoff::for_fetch_retries(),
            fetch_retries: FETCH_RETRIES,
            span,
        }
    }

    /// Overrides the retry schedule for balance and open-order fetches.
    pub fn with_fetch_retry(mut self, backoff: ExponentialBackoff, retries: u32) -> Self {
        self.fetch_backoff = backoff;
        self.fetch_retries = retries;
        self
    }

    pub fn with_fee_schedule(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    // =========================================================================
    // Order creation
    // =========================================================================

    pub fn create_limit_order(
        &self,
        action: OrderAction,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order, ExecutionError> {
        self.check_symbol(symbol)?;
        Ok(Order::limit(action, symbol, price, quantity))
    }

    pub fn create_market_order(
        &self,
        action: OrderAction,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Order, ExecutionError> {
        self.check_symbol(symbol)?;
        Ok(Order::market(action, symbol, quantity))
    }

    pub fn create_stop_order(
        &self,
        _action: OrderAction,
        _symbol: &str,
        _stop_price: Decimal,
        _quantity: Decimal,
    ) -> Result<Order, ExecutionError> {
        Err(ExecutionError::Unsupported("stop orders".to_string()))
    }

    pub fn create_stop_limit_order(
        &self,
        _action: OrderAction,
        _symbol: &str,
        _stop_price: Decimal,
        _limit_price: Decimal,
        _quantity: Decimal,
    ) -> Result<Order, ExecutionError> {
        Err(ExecutionError::Unsupported("stop-limit orders".to_string()))
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), ExecutionError> {
        if symbol != self.symbol {
            return Err(ExecutionError::WrongInstrument {
                expected: self.symbol.clone(),
                actual: symbol.to_string(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Caller-driven operations
    // =========================================================================

    /// Places `order` at the venue.
    ///
    /// On success the caller's copy gets the venue id and `Submitted` state,
    /// the order is registered and a `Submitted` event is emitted. On any
    /// failure the order is left untouched.
    pub async fn submit(&mut self, order: &mut Order) -> Result<OrderId, ExecutionError> {
        if order.state() != OrderState::Initial {
            return Err(ExecutionError::AlreadyProcessed(order.state()));
        }
        self.check_symbol(order.symbol())?;
        if !order.order_type().is_supported() {
            return Err(ExecutionError::Unsupported(format!(
                "{:?} orders",
                order.order_type()
            )));
        }

        let quantity = self.traits.round_size(order.quantity()).ok_or_else(|| {
            ExecutionError::Unsupported(format!("quantity {} is out of range", order.quantity()))
        })?;
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::Unsupported(format!(
                "quantity {} rounds to zero",
                order.quantity()
            )));
        }
        let side = order.side();

        let result = match (order.order_type(), order.price()) {
            (OrderType::Limit, Some(price)) => {
                let price = self.traits.round_price(price).ok_or_else(|| {
                    ExecutionError::Unsupported(format!("price {price} is out of range"))
                })?;
                self.gateway
                    .place_limit_order(&self.symbol, side, price, quantity)
                    .await
                    .map(|id| (id, Some(price)))
            }
            (OrderType::Limit, None) => {
                return Err(ExecutionError::Unsupported(
                    "limit order without a price".to_string(),
                ))
            }
            _ => self
                .gateway
                .place_market_order(&self.symbol, side, quantity)
                .await
                .map(|id| (id, None)),
        };

        let (id, price) = match result {
            Ok(placed) => placed,
            Err(e) => {
                warn!(parent: &self.span, error = %e, side = ?side, %quantity, "Order placement failed");
                return Err(ExecutionError::Gateway(e));
            }
        };

        order.set_id(id);
        order.set_price(price);
        order.set_quantity(quantity);
        order.switch_state(OrderState::Submitted)?;
        self.register(order.clone())?;

        info!(
            parent: &self.span,
            order_id = id,
            side = ?side,
            order_type = ?order.order_type(),
            price = ?price,
            %quantity,
            "Order submitted"
        );
        self.emit(order.clone(), OrderEventKind::Submitted, None);
        Ok(id)
    }

    /// Requests cancellation. The state change arrives later as a status push.
    pub async fn cancel(&self, order: &Order) -> Result<(), ExecutionError> {
        let id = order
            .id()
            .ok_or_else(|| ExecutionError::StaleOrder("order was never submitted".to_string()))?;
        let current = self
            .active
            .get(&id)
            .ok_or_else(|| ExecutionError::StaleOrder(format!("order {id} is not active anymore")))?;
        if current.is_fully_filled() {
            return Err(ExecutionError::StaleOrder(format!(
                "order {id} has already been filled"
            )));
        }

        self.gateway
            .cancel_order(&self.symbol, id)
            .await
            .map_err(ExecutionError::Gateway)?;
        info!(parent: &self.span, order_id = id, "Cancel requested");
        Ok(())
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Reloads cash and position from the venue.
    ///
    /// Transient failures are retried with backoff; only a rejection or an
    /// exhausted retry budget surfaces as `BalanceRefresh`.
    pub async fn refresh_balances(&mut self) -> Result<(), ExecutionError> {
        let balances = self
            .fetch_with_retry("balances", || self.gateway.balances())
            .await
            .map_err(ExecutionError::BalanceRefresh)?;

        self.cash = balances
            .get(&self.pair.quote)
            .copied()
            .unwrap_or_default()
            .round_dp(2);
        self.shares = balances.get(&self.pair.base).copied().unwrap_or_default();
        self.balances = balances;

        debug!(parent: &self.span, cash = %self.cash, shares = %self.shares, "Balances refreshed");
        Ok(())
    }

    /// Registers orders that were already open at the venue. No events.
    pub async fn import_open_orders(&mut self) -> Result<usize, ExecutionError> {
        let orders = self
            .fetch_with_retry("open orders", || self.gateway.open_orders(&self.symbol))
            .await
            .map_err(ExecutionError::Gateway)?;

        let count = orders.len();
        for order in orders {
            self.register(order)?;
        }
        info!(parent: &self.span, count, symbol = %self.symbol, "Loaded open orders");
        Ok(count)
    }

    async fn fetch_with_retry<T, F, Fut>(
        &self,
        fetch: &'static str,
        mut call: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut backoff = self.fetch_backoff.clone();
        backoff.reset();
        loop {
            match call().await {
                Err(e) if e.is_retryable() && backoff.attempt() < self.fetch_retries => {
                    let delay = backoff.next_delay();
                    warn!(
                        parent: &self.span,
                        fetch,
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    // =========================================================================
    // Venue-driven updates
    // =========================================================================

    /// Applies a public trade to the orders it references.
    ///
    /// Returns whether any registered order was involved.
    pub async fn on_trade_match(&mut self, trade: &TradeMatch) -> Result<bool, ExecutionError> {
        let ids: Vec<OrderId> = trade
            .order_ids()
            .into_iter()
            .filter(|id| self.active.contains_key(id))
            .collect();
        if ids.is_empty() {
            return Ok(false);
        }

        self.refresh_balances().await?;
        for id in ids {
            self.apply_match(id, trade)?;
        }
        Ok(true)
    }

    fn apply_match(&mut self, id: OrderId, trade: &TradeMatch) -> Result<(), ExecutionError> {
        let Some(order) = self.active.get_mut(&id) else {
            return Ok(());
        };
        if order.has_trade(trade.sequence) {
            debug!(parent: &self.span, order_id = id, trade_id = trade.sequence, "Trade already applied");
            return Ok(());
        }
        let size = trade.size.min(order.remaining());
        if size <= Decimal::ZERO {
            return Ok(());
        }

        let fee = self.fees.fee(order.order_type(), trade.price, size);
        let execution =
            ExecutionInfo::new(trade.price, size, fee, trade.timestamp).with_trade_id(trade.sequence);
        order.add_execution(execution.clone())?;

        let (state, kind) = if order.is_fully_filled() {
            (OrderState::Filled, OrderEventKind::Filled)
        } else {
            (OrderState::PartiallyFilled, OrderEventKind::PartiallyFilled)
        };
        order.switch_state(state)?;
        let updated = order.clone();

        if !updated.is_active() {
            self.unregister(id)?;
        }
        info!(
            parent: &self.span,
            order_id = id,
            price = %trade.price,
            %size,
            filled = %updated.filled(),
            state = ?state,
            "Trade matched"
        );
        self.emit(updated, kind, Some(execution));
        Ok(())
    }

    /// Applies an order-status push.
    pub async fn on_status_change(
        &mut self,
        change: &OrderStatusChange,
    ) -> Result<(), ExecutionError> {
        let Some(order) = self.active.get_mut(&change.order_id) else {
            debug!(parent: &self.span, order_id = change.order_id, "Status change for unknown order");
            return Ok(());
        };
        let current = order.state();

        let execution = change.fill.as_ref().and_then(|fill| {
            if fill.trade_id.is_some_and(|t| order.has_trade(t)) {
                return None;
            }
            let size = (fill.cumulative_filled - order.filled()).min(order.remaining());
            (size > Decimal::ZERO).then(|| {
                let info = ExecutionInfo::new(fill.price, size, fill.fee, fill.timestamp);
                match fill.trade_id {
                    Some(t) => info.with_trade_id(t),
                    None => info,
                }
            })
        });

        let fill_state = execution.as_ref().map(|e| {
            if order.filled() + e.size >= order.quantity() {
                OrderState::Filled
            } else {
                OrderState::PartiallyFilled
            }
        });
        let target = match (change.new_state, fill_state) {
            (Some(requested), _) if requested.is_terminal() => requested,
            (_, Some(from_fill)) => from_fill,
            (Some(requested), None) => requested,
            (None, None) => {
                debug!(parent: &self.span, order_id = change.order_id, "Status change carries nothing");
                return Ok(());
            }
        };

        if current.is_regression(target) || (target == current && execution.is_none()) {
            debug!(
                parent: &self.span,
                order_id = change.order_id,
                current = ?current,
                requested = ?target,
                "Ignoring stale status change"
            );
            return Ok(());
        }

        if let Some(execution) = &execution {
            order.add_execution(execution.clone())?;
        }
        order.switch_state(target)?;
        let updated = order.clone();

        if target.is_terminal() {
            self.unregister(change.order_id)?;
        }

        info!(
            parent: &self.span,
            order_id = change.order_id,
            from = ?current,
            to = ?target,
            filled = %updated.filled(),
            "Order state changed"
        );
        if let Some(kind) = OrderEventKind::for_state(target) {
            let execution = if target == OrderState::Rejected {
                None
            } else {
                execution.clone()
            };
            self.emit(updated, kind, execution);
        }

        if target.is_terminal() || execution.is_some() {
            self.refresh_balances().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn register(&mut self, order: Order) -> Result<(), ExecutionError> {
        let id = order.id().ok_or_else(|| {
            ExecutionError::InvariantViolation("registering an order without an id".to_string())
        })?;
        if self.active.contains_key(&id) {
            return Err(ExecutionError::InvariantViolation(format!(
                "order {id} is already registered"
            )));
        }
        self.active.insert(id, order);
        Ok(())
    }

    fn unregister(&mut self, id: OrderId) -> Result<Order, ExecutionError> {
        self.active.remove(&id).ok_or_else(|| {
            ExecutionError::InvariantViolation(format!("order {id} is not registered"))
        })
    }

    fn emit(&self, order: Order, kind: OrderEventKind, execution: Option<ExecutionInfo>) {
        let event = OrderEvent {
            order,
            kind,
            execution,
        };
        if self.events.send(event).is_err() {
            debug!(parent: &self.span, "Order event receiver dropped");
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn active_orders(&self) -> impl Iterator<Item = &Order> {
        self.active.values()
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.active.get(&id)
    }

    pub fn is_registered(&self, id: OrderId) -> bool {
        self.active.contains_key(&id)
    }

    /// Free quote-asset balance, rounded to cents.
    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Free base-asset balance.
    pub fn shares(&self) -> Decimal {
        self.shares
    }

    /// Every free balance reported at the last refresh.
    pub fn positions(&self) -> &HashMap<String, Decimal> {
        &self.balances
    }

    pub fn trading_pair(&self) -> &TradingPair {
        &self.pair
    }

    pub fn instrument_traits(&self) -> &InstrumentTraits {
        &self.traits
    }
}
