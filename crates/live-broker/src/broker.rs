use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use connector_core::{BrokerReceiver, StreamConsumer};
use execution_core::{BrokerMessage, Order, OrderAction, OrderId, OrderRegistry, TradeMatch};
use rust_decimal::Decimal;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn, Span};

use crate::error::BrokerError;

/// How long one dispatch waits for a venue message.
pub const DISPATCH_WAIT: Duration = Duration::from_millis(10);

/// Owns the registry and drains the stream's broker channel into it.
///
/// The broker is the registry's only writer, so every registry mutation
/// happens on whichever task drives [`dispatch`](Self::dispatch).
pub struct LiveBroker<S> {
    registry: OrderRegistry,
    stream: S,
    broker_rx: BrokerReceiver,
    stop: Arc<AtomicBool>,
    /// Exchange time to receipt for the last trade match.
    last_match_lag: Option<chrono::Duration>,
    span: Span,
}

impl<S: StreamConsumer> LiveBroker<S> {
    pub fn new(registry: OrderRegistry, stream: S, broker_rx: BrokerReceiver, span: Span) -> Self {
        Self {
            registry,
            stream,
            broker_rx,
            stop: Arc::new(AtomicBool::new(false)),
            last_match_lag: None,
            span,
        }
    }

    /// Balances, then open orders, then the stream.
    ///
    /// Any failure sets the stop flag before it is returned.
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        if let Err(e) = self.startup().await {
            self.stop.store(true, Ordering::SeqCst);
            error!(parent: &self.span, error = %e, "startup failed, broker stopped");
            return Err(e);
        }
        info!(
            parent: &self.span,
            cash = %self.registry.cash(),
            shares = %self.registry.shares(),
            "broker started"
        );
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), BrokerError> {
        self.registry.refresh_balances().await?;
        self.registry.import_open_orders().await?;
        self.stream.start().await?;
        Ok(())
    }

    /// Waits up to [`DISPATCH_WAIT`] for one venue message and applies it.
    ///
    /// Returns `Ok(true)` when the message touched a registered order, so the
    /// caller can keep draining without delay. `Ok(false)` covers empty ticks,
    /// matches for foreign orders and the stopped state. Fatal registry errors
    /// set the stop flag.
    pub async fn dispatch(&mut self) -> Result<bool, BrokerError> {
        if self.is_stopped() {
            return Ok(false);
        }

        let message = match tokio::time::timeout(DISPATCH_WAIT, self.broker_rx.recv()).await {
            Err(_) => return Ok(false),
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!(parent: &self.span, "broker channel closed, stopping");
                self.stop.store(true, Ordering::SeqCst);
                return Ok(false);
            }
        };

        match self.handle(message).await {
            Ok(evented) => Ok(evented),
            Err(e) if e.is_fatal() => {
                error!(parent: &self.span, error = %e, "fatal registry error, stopping");
                self.stop.store(true, Ordering::SeqCst);
                Err(e)
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "dropping venue message");
                Ok(true)
            }
        }
    }

    /// Whether the message concerned one of our orders.
    async fn handle(&mut self, message: BrokerMessage) -> Result<bool, BrokerError> {
        match message {
            BrokerMessage::TradeMatch(trade) => {
                self.record_lag(&trade);
                Ok(self.registry.on_trade_match(&trade).await?)
            }
            BrokerMessage::StatusChange(change) => {
                let known = self.registry.is_registered(change.order_id);
                self.registry.on_status_change(&change).await?;
                Ok(known)
            }
        }
    }

    fn record_lag(&mut self, trade: &TradeMatch) {
        let lag = Utc::now().signed_duration_since(trade.timestamp);
        debug!(
            parent: &self.span,
            trade_id = trade.sequence,
            lag_ms = lag.num_milliseconds(),
            "trade match received"
        );
        self.last_match_lag = Some(lag);
    }

    /// Dispatches until stopped, then drains without blocking.
    pub async fn run(&mut self) -> Result<(), BrokerError> {
        while !self.is_stopped() {
            self.dispatch().await?;
        }
        self.drain().await
    }

    /// Applies whatever is already queued. Used after stop so status
    /// changes that raced the shutdown still reach the registry.
    async fn drain(&mut self) -> Result<(), BrokerError> {
        loop {
            match self.broker_rx.try_recv() {
                Ok(message) => {
                    if let Err(e) = self.handle(message).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(parent: &self.span, error = %e, "dropping venue message");
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Sets the stop flag and signals the stream.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stream.stop();
    }

    /// Waits for the stream's tasks to finish. Call after [`stop`](Self::stop).
    pub async fn join(&mut self) {
        self.stream.join().await;
        info!(parent: &self.span, active_orders = self.registry.active_orders().count(), "broker stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Setting the returned flag stops [`run`](Self::run) at its next tick.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    // =========================================================================
    // Trading
    // =========================================================================

    pub fn create_limit_order(
        &self,
        action: OrderAction,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order, BrokerError> {
        Ok(self
            .registry
            .create_limit_order(action, symbol, price, quantity)?)
    }

    pub fn create_market_order(
        &self,
        action: OrderAction,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Order, BrokerError> {
        Ok(self.registry.create_market_order(action, symbol, quantity)?)
    }

    pub fn create_stop_order(
        &self,
        action: OrderAction,
        symbol: &str,
        stop_price: Decimal,
        quantity: Decimal,
    ) -> Result<Order, BrokerError> {
        Ok(self
            .registry
            .create_stop_order(action, symbol, stop_price, quantity)?)
    }

    pub fn create_stop_limit_order(
        &self,
        action: OrderAction,
        symbol: &str,
        stop_price: Decimal,
        limit_price: Decimal,
        quantity: Decimal,
    ) -> Result<Order, BrokerError> {
        Ok(self.registry.create_stop_limit_order(
            action,
            symbol,
            stop_price,
            limit_price,
            quantity,
        )?)
    }

    pub async fn submit_order(&mut self, order: &mut Order) -> Result<OrderId, BrokerError> {
        if self.is_stopped() {
            return Err(BrokerError::Stopped);
        }
        Ok(self.registry.submit(order).await?)
    }

    pub async fn cancel_order(&self, order: &Order) -> Result<(), BrokerError> {
        if self.is_stopped() {
            return Err(BrokerError::Stopped);
        }
        Ok(self.registry.cancel(order).await?)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn registry(&self) -> &OrderRegistry {
        &self.registry
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn last_match_lag(&self) -> Option<chrono::Duration> {
        self.last_match_lag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::ExponentialBackoff;
    use connector_core::{create_broker_channel, BrokerSender, ConnectorError};
    use execution_core::{
        create_order_event_channel, CumulativeFill, ExecutionError, GatewayError,
        OrderEventKind, OrderEventReceiver, OrderSide, OrderState, OrderStatusChange,
        VenueGateway,
    };
    use model::{InstrumentTraits, Snapshot, TradingPair};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeGateway {
        balance_calls: Mutex<usize>,
        fail_balances: Mutex<bool>,
        flaky_balances: Mutex<usize>,
        open: Mutex<Vec<Order>>,
    }

    #[async_trait]
    impl VenueGateway for FakeGateway {
        async fn balances(&self) -> Result<HashMap<String, Decimal>, GatewayError> {
            *self.balance_calls.lock() += 1;
            if *self.fail_balances.lock() {
                return Err(GatewayError::Transient("timeout".to_string()));
            }
            let mut flaky = self.flaky_balances.lock();
            if *flaky > 0 {
                *flaky -= 1;
                return Err(GatewayError::Transient("timeout".to_string()));
            }
            Ok(HashMap::from([
                ("USDT".to_string(), dec!(500)),
                ("BTC".to_string(), dec!(0)),
            ]))
        }

        async fn place_limit_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _price: Decimal,
            _quantity: Decimal,
        ) -> Result<OrderId, GatewayError> {
            Ok(7)
        }

        async fn place_market_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _quantity: Decimal,
        ) -> Result<OrderId, GatewayError> {
            Ok(8)
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: OrderId) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn open_orders(&self, _symbol: &str) -> Result<Vec<Order>, GatewayError> {
            Ok(self.open.lock().clone())
        }

        async fn snapshot(&self, _symbol: &str) -> Result<Snapshot, GatewayError> {
            Ok(Snapshot::from_levels(1, &[], &[]))
        }
    }

    #[derive(Default)]
    struct FakeStream {
        started: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl StreamConsumer for FakeStream {
        async fn start(&mut self) -> Result<(), ConnectorError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn join(&mut self) {}

        fn is_running(&self) -> bool {
            self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        broker: LiveBroker<FakeStream>,
        gateway: Arc<FakeGateway>,
        venue: BrokerSender,
        events: OrderEventReceiver,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(FakeGateway::default());
        let (events_tx, events) = create_order_event_channel();
        let registry = OrderRegistry::new(
            gateway.clone(),
            TradingPair::new("BTC", "USDT"),
            InstrumentTraits::new(dec!(0.01), dec!(0.0001)),
            events_tx,
            Span::none(),
        )
        .with_fetch_retry(ExponentialBackoff::new(Duration::ZERO, Duration::ZERO, 0.0), 1);
        let (venue, broker_rx) = create_broker_channel(16);
        let broker = LiveBroker::new(registry, FakeStream::default(), broker_rx, Span::none());
        Harness {
            broker,
            gateway,
            venue,
            events,
        }
    }

    fn status(order_id: OrderId, state: OrderState, fill: Option<CumulativeFill>) -> BrokerMessage {
        BrokerMessage::StatusChange(OrderStatusChange {
            order_id,
            new_state: Some(state),
            fill,
            event_time_ms: 0,
        })
    }

    fn trade(sequence: u64, size: Decimal, buyer: OrderId) -> BrokerMessage {
        BrokerMessage::TradeMatch(TradeMatch {
            sequence,
            timestamp: Utc::now(),
            price: dec!(100),
            size,
            buyer_order_id: Some(buyer),
            seller_order_id: None,
        })
    }

    #[tokio::test]
    async fn test_limit_order_lifecycle_through_channel() {
        let mut h = harness();
        h.broker.start().await.unwrap();
        assert!(h.broker.stream().is_running());

        let mut order = h
            .broker
            .create_limit_order(OrderAction::Buy, "BTCUSDT", dec!(100), dec!(1.0))
            .unwrap();
        let id = h.broker.submit_order(&mut order).await.unwrap();
        assert_eq!(id, 7);
        assert_eq!(h.events.recv().await.unwrap().kind, OrderEventKind::Submitted);

        h.venue.send(status(id, OrderState::Accepted, None)).await.unwrap();
        assert!(h.broker.dispatch().await.unwrap());
        let accepted = h.events.recv().await.unwrap();
        assert_eq!(accepted.kind, OrderEventKind::Accepted);
        assert_eq!(accepted.order.state(), OrderState::Accepted);

        h.venue.send(trade(1, dec!(0.4), id)).await.unwrap();
        assert!(h.broker.dispatch().await.unwrap());
        let partial = h.events.recv().await.unwrap();
        assert_eq!(partial.kind, OrderEventKind::PartiallyFilled);
        assert_eq!(partial.order.filled(), dec!(0.4));
        assert!(h.broker.last_match_lag().is_some());

        let fill = CumulativeFill {
            price: dec!(100),
            cumulative_filled: dec!(1.0),
            fee: dec!(0),
            timestamp: Utc::now(),
            trade_id: Some(2),
        };
        h.venue
            .send(status(id, OrderState::Filled, Some(fill)))
            .await
            .unwrap();
        assert!(h.broker.dispatch().await.unwrap());
        let filled = h.events.recv().await.unwrap();
        assert_eq!(filled.kind, OrderEventKind::Filled);
        assert_eq!(filled.order.filled(), dec!(1.0));
        assert_eq!(filled.execution.unwrap().size, dec!(0.6));

        assert!(!h.broker.registry().is_registered(id));
        // startup, the trade match, and the terminal status change
        assert_eq!(*h.gateway.balance_calls.lock(), 3);
    }

    #[tokio::test]
    async fn test_failed_balance_refresh_stops_before_stream() {
        let mut h = harness();
        *h.gateway.fail_balances.lock() = true;

        let err = h.broker.start().await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Execution(ExecutionError::BalanceRefresh(_))
        ));
        assert!(h.broker.is_stopped());
        assert!(!h.broker.stream().started.load(Ordering::SeqCst));
        assert!(!h.broker.dispatch().await.unwrap());
    }

    #[tokio::test]
    async fn test_open_orders_registered_before_stream_starts() {
        let mut h = harness();
        let resting = Order::restored(
            55,
            "BTCUSDT",
            OrderSide::Sell,
            execution_core::OrderType::Limit,
            Some(dec!(110)),
            dec!(0.2),
            None,
        );
        h.gateway.open.lock().push(resting);

        h.broker.start().await.unwrap();
        assert!(h.broker.registry().is_registered(55));

        h.venue
            .send(status(55, OrderState::Canceled, None))
            .await
            .unwrap();
        assert!(h.broker.dispatch().await.unwrap());
        assert_eq!(h.events.recv().await.unwrap().kind, OrderEventKind::Canceled);
        assert!(!h.broker.registry().is_registered(55));
    }

    #[tokio::test]
    async fn test_empty_tick_is_not_an_error() {
        let mut h = harness();
        h.broker.start().await.unwrap();
        assert!(!h.broker.dispatch().await.unwrap());
        assert!(!h.broker.is_stopped());
    }

    #[tokio::test]
    async fn test_closed_channel_sets_stop_flag() {
        let mut h = harness();
        h.broker.start().await.unwrap();
        drop(h.venue);

        assert!(!h.broker.dispatch().await.unwrap());
        assert!(h.broker.is_stopped());
        assert!(matches!(
            h.broker
                .submit_order(&mut Order::market(OrderAction::Buy, "BTCUSDT", dec!(1)))
                .await,
            Err(BrokerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_fatal_error_stops_dispatch() {
        let mut h = harness();
        h.broker.start().await.unwrap();
        let mut order = h
            .broker
            .create_limit_order(OrderAction::Buy, "BTCUSDT", dec!(100), dec!(1.0))
            .unwrap();
        let id = h.broker.submit_order(&mut order).await.unwrap();

        *h.gateway.fail_balances.lock() = true;
        h.venue.send(trade(3, dec!(0.5), id)).await.unwrap();

        let err = h.broker.dispatch().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(h.broker.is_stopped());
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_dispatching() {
        let mut h = harness();
        h.broker.start().await.unwrap();
        let mut order = h
            .broker
            .create_limit_order(OrderAction::Buy, "BTCUSDT", dec!(100), dec!(1.0))
            .unwrap();
        let id = h.broker.submit_order(&mut order).await.unwrap();
        h.events.recv().await.unwrap();

        *h.gateway.flaky_balances.lock() = 1;
        h.venue.send(trade(4, dec!(0.5), id)).await.unwrap();

        assert!(h.broker.dispatch().await.unwrap());
        assert!(!h.broker.is_stopped());
        let partial = h.events.recv().await.unwrap();
        assert_eq!(partial.kind, OrderEventKind::PartiallyFilled);
        assert_eq!(partial.order.filled(), dec!(0.5));
    }

    #[tokio::test]
    async fn test_foreign_messages_report_no_event() {
        let mut h = harness();
        h.broker.start().await.unwrap();

        h.venue.send(trade(5, dec!(1), 4242)).await.unwrap();
        assert!(!h.broker.dispatch().await.unwrap());
        h.venue
            .send(status(4242, OrderState::Accepted, None))
            .await
            .unwrap();
        assert!(!h.broker.dispatch().await.unwrap());

        assert!(!h.broker.is_stopped());
        assert!(h.events.try_recv().is_err());
        // no balance refresh for orders that are not ours
        assert_eq!(*h.gateway.balance_calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_stop_handle_ends_run_and_signals_stream() {
        let mut h = harness();
        h.broker.start().await.unwrap();
        h.venue
            .send(status(99, OrderState::Accepted, None))
            .await
            .unwrap();

        let stop = h.broker.stop_handle();
        stop.store(true, Ordering::SeqCst);
        h.broker.run().await.unwrap();

        h.broker.stop();
        h.broker.join().await;
        assert!(h.broker.stream().stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_orders_are_unsupported() {
        let h = harness();
        assert!(matches!(
            h.broker
                .create_stop_order(OrderAction::Sell, "BTCUSDT", dec!(90), dec!(1)),
            Err(BrokerError::Execution(ExecutionError::Unsupported(_)))
        ));
        assert!(matches!(
            h.broker
                .create_limit_order(OrderAction::Buy, "ETHUSDT", dec!(1), dec!(1)),
            Err(BrokerError::Execution(ExecutionError::WrongInstrument { .. }))
        ));
    }
}
