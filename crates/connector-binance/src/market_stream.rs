//! Public market data session: trades and depth for one symbol.
//!
//! Each connection starts a fresh synchronizer generation and fetches a
//! REST snapshot in a background task, so depth frames keep flowing into
//! the synchronizer's buffer while the request is in flight.

use std::sync::Arc;
use std::time::Instant;

use common::{BinanceEnvironment, ExponentialBackoff};
use connector_core::{
    require_sequencing, BrokerSender, ConnectorConfig, ConnectorError, EventSender,
    MessageTranslator, Translated,
};
use execution_core::{BrokerMessage, VenueGateway};
use futures_util::{SinkExt, StreamExt};
use metrics::SharedMetrics;
use model::{Exchange, MarketEvent, Snapshot};
use orderbook::{BookSynchronizer, SnapshotOutcome, SnapshotRequest, SyncOutcome};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::session::{
    connect_with_timeout, pong, shutdown_requested, wait_backoff, ConnectResult, SessionResult,
    WsWrite, STABLE_CONNECTION_THRESHOLD,
};

pub(crate) fn build_stream_url(
    symbol: &str,
    environment: BinanceEnvironment,
    depth_speed_ms: u32,
) -> String {
    let sym_lower = symbol.to_lowercase();
    environment.ws_combined_url(&[
        format!("{sym_lower}@trade"),
        format!("{sym_lower}@depth@{depth_speed_ms}ms"),
    ])
}

type SnapshotDelivery = (u64, Snapshot);

pub(crate) struct MarketStream {
    url: String,
    symbol: String,
    translator: Box<dyn MessageTranslator>,
    synchronizer: BookSynchronizer,
    gateway: Arc<dyn VenueGateway>,
    events: EventSender,
    broker: BrokerSender,
    metrics: SharedMetrics,
    snapshot_tx: mpsc::Sender<SnapshotDelivery>,
    snapshot_rx: mpsc::Receiver<SnapshotDelivery>,
    snapshot_task: Option<JoinHandle<()>>,
    span: Span,
}

impl MarketStream {
    /// Fails with `UnsupportedVenue` if `translator` cannot sequence depth.
    pub(crate) fn new(
        config: &ConnectorConfig,
        translator: Box<dyn MessageTranslator>,
        gateway: Arc<dyn VenueGateway>,
        events: EventSender,
        broker: BrokerSender,
        metrics: SharedMetrics,
        span: Span,
    ) -> Result<Self, ConnectorError> {
        require_sequencing(translator.as_ref())?;

        let symbol = config.symbol();
        let synchronizer = BookSynchronizer::new(
            Exchange::Binance,
            symbol.clone(),
            config.traits,
            config.synchronizer_config(),
            span.clone(),
        );
        let (snapshot_tx, snapshot_rx) = mpsc::channel(4);

        Ok(Self {
            url: build_stream_url(&symbol, config.environment, config.depth_speed_ms),
            symbol,
            translator,
            synchronizer,
            gateway,
            events,
            broker,
            metrics,
            snapshot_tx,
            snapshot_rx,
            snapshot_task: None,
            span,
        })
    }

    /// Runs sessions until shutdown, reconnecting with backoff.
    ///
    /// Returns `Err(ChannelClosed)` once a downstream receiver is gone;
    /// there is nobody left to deliver to.
    pub(crate) async fn run(
        mut self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let mut backoff = ExponentialBackoff::default();
        let mut reconnecting = false;

        loop {
            if *shutdown_rx.borrow() {
                info!(parent: &self.span, "shutdown requested, exiting market stream");
                return Ok(());
            }

            let result = self.run_session(&mut shutdown_rx).await;
            self.end_session();

            match result {
                SessionResult::Shutdown => {
                    info!(parent: &self.span, "market stream shutdown complete");
                    return Ok(());
                }
                SessionResult::Connected { duration, error } => {
                    if reconnecting {
                        self.metrics.inc_reconnect_successes();
                    }
                    reconnecting = true;

                    if matches!(error, ConnectorError::ChannelClosed) {
                        info!(parent: &self.span, "receiver dropped, exiting market stream");
                        return Err(ConnectorError::ChannelClosed);
                    }

                    if duration >= STABLE_CONNECTION_THRESHOLD {
                        info!(
                            parent: &self.span,
                            duration_secs = duration.as_secs(),
                            "connection was stable, resetting backoff"
                        );
                        backoff.reset();
                    }

                    self.metrics.inc_reconnect_attempts();
                    warn!(
                        parent: &self.span,
                        error = %error,
                        attempt = backoff.attempt(),
                        "market stream lost, reconnecting"
                    );
                }
                SessionResult::ConnectFailed(error) => {
                    self.metrics.inc_connection_failures();
                    reconnecting = true;
                    warn!(
                        parent: &self.span,
                        error = %error,
                        attempt = backoff.attempt(),
                        "market stream connection failed, retrying"
                    );
                }
            }

            if !wait_backoff(&mut backoff, &mut shutdown_rx).await {
                info!(parent: &self.span, "shutdown requested during backoff");
                return Ok(());
            }
        }
    }

    async fn run_session(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> SessionResult {
        info!(parent: &self.span, url = %self.url, "connecting to market stream");

        let ws_stream = match connect_with_timeout(&self.url, shutdown_rx).await {
            ConnectResult::Connected(stream) => stream,
            ConnectResult::Shutdown => return SessionResult::Shutdown,
            ConnectResult::Error(e) => return SessionResult::ConnectFailed(e),
        };

        info!(parent: &self.span, "market stream connected");
        let connected_at = Instant::now();
        self.begin_sync();

        let (mut write, mut read) = ws_stream.split();

        loop {
            let failure = tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if shutdown_requested(changed, shutdown_rx) {
                        let _ = write.close().await;
                        return SessionResult::Shutdown;
                    }
                    None
                }

                Some((generation, snapshot)) = self.snapshot_rx.recv() => {
                    self.handle_snapshot(generation, snapshot).await.err()
                }

                frame = read.next() => self.handle_frame(frame, &mut write).await,
            };

            if let Some(error) = failure {
                return SessionResult::Connected {
                    duration: connected_at.elapsed(),
                    error,
                };
            }
        }
    }

    /// Returns the error that ends the session, if any.
    async fn handle_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        write: &mut WsWrite,
    ) -> Option<ConnectorError> {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_text(&text).await.err(),
            Some(Ok(Message::Ping(data))) => {
                debug!(parent: &self.span, "received ping, sending pong");
                let result = pong(write, data).await;
                if result.is_err() {
                    self.metrics.inc_websocket_errors();
                }
                result.err()
            }
            Some(Ok(Message::Close(_))) => {
                info!(parent: &self.span, "market stream closed by server");
                Some(ConnectorError::ConnectionClosed)
            }
            Some(Ok(_)) => None,
            Some(Err(e)) => {
                error!(parent: &self.span, error = %e, "market stream socket error");
                self.metrics.inc_websocket_errors();
                Some(ConnectorError::WebSocket(e.to_string()))
            }
            None => {
                info!(parent: &self.span, "market stream ended");
                Some(ConnectorError::ConnectionClosed)
            }
        }
    }

    /// Starts a new synchronizer generation and requests its snapshot.
    fn begin_sync(&mut self) {
        let request = self.synchronizer.begin();
        self.request_snapshot(request);
    }

    fn end_session(&mut self) {
        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }
        self.metrics.set_book_live(false);
    }

    /// Translates one text frame and routes the result.
    ///
    /// Only a closed downstream channel is an error; malformed frames are
    /// counted against the synchronizer.
    async fn handle_text(&mut self, text: &str) -> Result<(), ConnectorError> {
        self.metrics.inc_messages_received();

        match self.translator.translate(text) {
            Ok(Translated::Depth(batch)) => {
                self.metrics.inc_depth_batches_received();
                let outcome = self.synchronizer.on_batch(batch);
                self.handle_sync_outcome(outcome).await
            }
            Ok(Translated::Trade { trade, matched }) => {
                self.metrics.inc_trades_received();
                self.publish(MarketEvent::Trade(trade)).await?;
                if let Some(matched) = matched {
                    self.metrics.inc_trade_matches();
                    self.broker
                        .send(BrokerMessage::TradeMatch(matched))
                        .await
                        .map_err(|_| ConnectorError::ChannelClosed)?;
                }
                Ok(())
            }
            Ok(Translated::StatusChange(_)) | Ok(Translated::Ignored) => Ok(()),
            Err(e) => {
                self.metrics.inc_parse_errors();
                let outcome = self.synchronizer.on_protocol_violation(&e.to_string());
                self.handle_sync_outcome(outcome).await
            }
        }
    }

    async fn handle_sync_outcome(&mut self, outcome: SyncOutcome) -> Result<(), ConnectorError> {
        match outcome {
            SyncOutcome::Applied(update) => {
                self.metrics.inc_depth_batches_applied();
                self.metrics.set_book_live(true);
                self.publish(MarketEvent::BookUpdate(update)).await
            }
            SyncOutcome::Buffered => Ok(()),
            SyncOutcome::Stale | SyncOutcome::Rejected => {
                self.metrics.inc_depth_batches_dropped();
                Ok(())
            }
            SyncOutcome::Resync(request) => {
                self.metrics.inc_resyncs();
                self.request_snapshot(request);
                Ok(())
            }
        }
    }

    async fn handle_snapshot(
        &mut self,
        generation: u64,
        snapshot: Snapshot,
    ) -> Result<(), ConnectorError> {
        match self.synchronizer.on_snapshot(generation, snapshot) {
            SnapshotOutcome::Synchronized(book) => {
                self.metrics.set_book_live(true);
                self.publish(MarketEvent::BookSnapshot(book)).await
            }
            SnapshotOutcome::Ignored => {
                debug!(parent: &self.span, generation, "ignoring superseded snapshot");
                Ok(())
            }
            SnapshotOutcome::Resync(request) => {
                self.metrics.inc_resyncs();
                self.request_snapshot(request);
                Ok(())
            }
        }
    }

    async fn publish(&self, event: MarketEvent) -> Result<(), ConnectorError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }

    /// Replaces any in-flight fetch with one for `request.generation`.
    ///
    /// The fetch retries until it succeeds or is aborted; the result comes
    /// back through `snapshot_rx` so the session loop applies it.
    fn request_snapshot(&mut self, request: SnapshotRequest) {
        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }

        let gateway = Arc::clone(&self.gateway);
        let metrics = Arc::clone(&self.metrics);
        let tx = self.snapshot_tx.clone();
        let symbol = self.symbol.clone();
        let generation = request.generation;

        let fetch = async move {
            let mut backoff = ExponentialBackoff::for_snapshot_retries();
            loop {
                match gateway.snapshot(&symbol).await {
                    Ok(snapshot) => {
                        metrics.inc_snapshots_fetched();
                        info!(generation, sequence = snapshot.sequence, "depth snapshot fetched");
                        // The session may have ended meanwhile.
                        let _ = tx.send((generation, snapshot)).await;
                        return;
                    }
                    Err(e) => {
                        metrics.inc_snapshot_failures();
                        let delay = backoff.next_delay();
                        warn!(
                            generation,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "depth snapshot fetch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        self.snapshot_task = Some(tokio::spawn(fetch.instrument(self.span.clone())));
    }
}

impl Drop for MarketStream {
    fn drop(&mut self) {
        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::BinanceMarketTranslator;
    use async_trait::async_trait;
    use connector_core::{create_broker_channel, create_event_channel, EventReceiver};
    use execution_core::{GatewayError, Order, OrderId, OrderSide};
    use metrics::create_metrics;
    use model::{InstrumentTraits, TradingPair};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct SnapshotGateway {
        sequence: u64,
    }

    #[async_trait]
    impl VenueGateway for SnapshotGateway {
        async fn balances(&self) -> Result<HashMap<String, Decimal>, GatewayError> {
            Err(GatewayError::Rejected("unused".to_string()))
        }

        async fn place_limit_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _price: Decimal,
            _quantity: Decimal,
        ) -> Result<OrderId, GatewayError> {
            Err(GatewayError::Rejected("unused".to_string()))
        }

        async fn place_market_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _quantity: Decimal,
        ) -> Result<OrderId, GatewayError> {
            Err(GatewayError::Rejected("unused".to_string()))
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: OrderId) -> Result<(), GatewayError> {
            Err(GatewayError::Rejected("unused".to_string()))
        }

        async fn open_orders(&self, _symbol: &str) -> Result<Vec<Order>, GatewayError> {
            Ok(Vec::new())
        }

        async fn snapshot(&self, _symbol: &str) -> Result<Snapshot, GatewayError> {
            Ok(Snapshot::from_levels(
                self.sequence,
                &[(dec!(100), dec!(2))],
                &[(dec!(101), dec!(1))],
            ))
        }
    }

    fn config() -> ConnectorConfig {
        ConnectorConfig {
            pair: TradingPair::new("BTC", "USDT"),
            traits: InstrumentTraits::new(dec!(0.01), dec!(0.00001)),
            ..ConnectorConfig::default()
        }
    }

    fn depth(first: u64, last: u64, bid: &str) -> String {
        format!(
            r#"{{"stream":"btcusdt@depth@100ms","data":{{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":{first},"u":{last},"b":[["100.00","{bid}"]],"a":[]}}}}"#
        )
    }

    fn stream(
        snapshot_sequence: u64,
    ) -> (
        MarketStream,
        EventReceiver,
        connector_core::BrokerReceiver,
        SharedMetrics,
    ) {
        let (events, events_rx) = create_event_channel(16);
        let (broker, broker_rx) = create_broker_channel(16);
        let metrics = create_metrics();
        let stream = MarketStream::new(
            &config(),
            Box::new(BinanceMarketTranslator::new()),
            Arc::new(SnapshotGateway {
                sequence: snapshot_sequence,
            }),
            events,
            broker,
            Arc::clone(&metrics),
            Span::none(),
        )
        .unwrap();
        (stream, events_rx, broker_rx, metrics)
    }

    async fn deliver_snapshot(stream: &mut MarketStream) {
        let (generation, snapshot) = stream.snapshot_rx.recv().await.unwrap();
        stream.handle_snapshot(generation, snapshot).await.unwrap();
    }

    #[test]
    fn test_build_stream_url() {
        assert_eq!(
            build_stream_url("BTCUSDT", BinanceEnvironment::Production, 100),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/btcusdt@depth@100ms"
        );
        assert_eq!(
            build_stream_url("ETHUSDT", BinanceEnvironment::Testnet, 1000),
            "wss://stream.testnet.binance.vision:9443/stream?streams=ethusdt@trade/ethusdt@depth@1000ms"
        );
    }

    #[tokio::test]
    async fn test_buffered_depth_is_replayed_onto_snapshot() {
        let (mut stream, mut events_rx, _broker_rx, metrics) = stream(100);
        stream.begin_sync();

        stream.handle_text(&depth(99, 101, "3")).await.unwrap();
        stream.handle_text(&depth(102, 102, "4")).await.unwrap();
        assert!(events_rx.try_recv().is_err());

        deliver_snapshot(&mut stream).await;
        match events_rx.recv().await.unwrap() {
            MarketEvent::BookSnapshot(book) => {
                assert_eq!(book.sequence, 102);
                assert_eq!(book.best_bid().unwrap().size, dec!(4));
            }
            other => panic!("Expected BookSnapshot, got {other:?}"),
        }
        assert!(metrics.is_book_live());

        stream.handle_text(&depth(103, 103, "5")).await.unwrap();
        match events_rx.recv().await.unwrap() {
            MarketEvent::BookUpdate(update) => {
                assert_eq!(update.final_sequence, 103);
                assert_eq!(update.best_bid.unwrap().size, dec!(5));
            }
            other => panic!("Expected BookUpdate, got {other:?}"),
        }
        assert_eq!(metrics.depth_batches_applied(), 1);
    }

    #[tokio::test]
    async fn test_gap_forces_resync_and_new_snapshot() {
        let (mut stream, mut events_rx, _broker_rx, metrics) = stream(100);
        stream.begin_sync();
        stream.handle_text(&depth(101, 101, "3")).await.unwrap();
        deliver_snapshot(&mut stream).await;
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            MarketEvent::BookSnapshot(_)
        ));

        let generation = stream.synchronizer.generation();
        stream.handle_text(&depth(110, 111, "6")).await.unwrap();

        assert_eq!(metrics.resyncs(), 1);
        assert!(!metrics.is_book_live());
        assert!(stream.synchronizer.generation() > generation);
        assert!(stream.snapshot_task.is_some());
    }

    #[tokio::test]
    async fn test_trade_match_goes_to_broker_channel() {
        let (mut stream, mut events_rx, mut broker_rx, metrics) = stream(100);
        let trade = r#"{"e":"trade","E":1,"s":"BTCUSDT","t":7,"p":"100.5","q":"0.2","b":11,"a":12,"T":1,"m":false,"M":true}"#;

        stream.handle_text(trade).await.unwrap();

        assert!(matches!(events_rx.recv().await.unwrap(), MarketEvent::Trade(_)));
        match broker_rx.recv().await.unwrap() {
            BrokerMessage::TradeMatch(m) => {
                assert_eq!(m.sequence, 7);
                assert_eq!(m.buyer_order_id, Some(11));
            }
            other => panic!("Expected TradeMatch, got {other:?}"),
        }
        assert_eq!(metrics.snapshot().trades_received, 1);
        assert_eq!(metrics.snapshot().trade_matches, 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_count_as_violations() {
        let (mut stream, _events_rx, _broker_rx, metrics) = stream(100);
        stream.begin_sync();

        stream.handle_text("{garbage").await.unwrap();
        assert_eq!(metrics.parse_errors(), 1);
    }

    #[tokio::test]
    async fn test_closed_event_receiver_ends_session() {
        let (mut stream, events_rx, _broker_rx, _metrics) = stream(100);
        drop(events_rx);
        let trade = r#"{"e":"trade","E":1,"s":"BTCUSDT","t":8,"p":"100","q":"1","T":1,"m":true,"M":true}"#;

        let err = stream.handle_text(trade).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ChannelClosed));
    }
}
