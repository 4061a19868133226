use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use binance_rest::{ApiCredentials, BinanceRestClient};
use connector_binance::BinanceStream;
use connector_core::{create_broker_channel, create_event_channel, ConnectorConfig};
use execution_core::{create_order_event_channel, OrderEvent, OrderRegistry};
use live_broker::LiveBroker;
use metrics::create_metrics;
use model::{BookLevel, MarketEvent};
use tracing::{debug, error, info, info_span};

/// Interval for periodic health status logging.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    common::init_logging();

    if let Err(e) = run().await {
        error!(error = %e, "Live connector failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConnectorConfig::from_env()?;
    let credentials = ApiCredentials::from_env()?;
    let symbol = config.symbol();

    info!(symbol = %symbol, environment = ?config.environment, "Starting live connector");

    let rest = Arc::new(
        BinanceRestClient::with_environment(credentials, config.environment)?
            .with_depth_limit(config.depth_limit),
    );
    rest.sync_time().await?;

    let metrics = create_metrics();
    let (events_tx, mut events_rx) = create_event_channel(config.channel_capacity);
    let (broker_tx, broker_rx) = create_broker_channel(config.broker_channel_capacity);
    let (orders_tx, mut orders_rx) = create_order_event_channel();

    let registry = OrderRegistry::new(
        rest.clone(),
        config.pair.clone(),
        config.traits,
        orders_tx,
        info_span!("registry", symbol = %symbol),
    );
    let stream = BinanceStream::new(config, rest, events_tx, broker_tx, metrics.clone());
    let mut broker = LiveBroker::new(registry, stream, broker_rx, info_span!("broker", symbol = %symbol));

    broker.start().await?;

    let stop = broker.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, initiating shutdown");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let health_metrics = metrics.clone();
    let health_stop = broker.stop_handle();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
        loop {
            interval.tick().await;
            if health_stop.load(Ordering::SeqCst) {
                break;
            }
            let snapshot = health_metrics.snapshot();
            info!(
                status = %snapshot.health_status(),
                book_live = snapshot.book_live,
                trades = snapshot.trades_received,
                resyncs = snapshot.resyncs,
                errors = snapshot.websocket_errors + snapshot.parse_errors,
                reconnects = snapshot.reconnect_attempts,
                "Health check"
            );
        }
    });

    let market_printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_market_event(&event);
        }
    });
    let order_printer = tokio::spawn(async move {
        while let Some(event) = orders_rx.recv().await {
            print_order_event(&event);
        }
    });

    let result = broker.run().await;

    broker.stop();
    broker.join().await;
    // Dropping the broker closes both event channels and ends the printers.
    drop(broker);
    let _ = market_printer.await;
    let _ = order_printer.await;

    println!("\n{}", metrics.snapshot());
    info!("Shutdown complete");

    result?;
    Ok(())
}

fn level(level: Option<BookLevel>) -> String {
    level.map_or_else(|| "-".to_string(), |l| format!("{} x {}", l.price, l.size))
}

fn print_market_event(event: &MarketEvent) {
    match event {
        MarketEvent::Trade(trade) => {
            println!(
                "{} | {} | trade | price: {} | size: {} | {:?}",
                trade.timestamp_ms, trade.symbol, trade.price, trade.size, trade.direction
            );
        }
        MarketEvent::BookSnapshot(book) => {
            println!(
                "{} | book snapshot @ {} | bid: {} | ask: {} | levels: {}/{}",
                book.symbol,
                book.sequence,
                level(book.best_bid()),
                level(book.best_ask()),
                book.bids.len(),
                book.asks.len()
            );
        }
        MarketEvent::BookUpdate(update) => {
            debug!(
                symbol = %update.symbol,
                sequence = update.final_sequence,
                bid = %level(update.best_bid),
                ask = %level(update.best_ask),
                "Book update"
            );
        }
    }
}

fn print_order_event(event: &OrderEvent) {
    let order = &event.order;
    let execution = event
        .execution
        .as_ref()
        .map_or_else(String::new, |e| format!(" | exec {} @ {} fee {}", e.size, e.price, e.fee));
    println!(
        "order {} | {:?} | {:?} {} {} | filled {}{}",
        order.id().unwrap_or_default(),
        event.kind,
        order.action(),
        order.quantity(),
        order.symbol(),
        order.filled(),
        execution
    );
}
