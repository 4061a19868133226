use std::sync::Arc;

use async_trait::async_trait;
use binance_rest::BinanceRestClient;
use connector_core::{BrokerSender, ConnectorConfig, ConnectorError, EventSender, StreamConsumer};
use execution_core::VenueGateway;
use metrics::SharedMetrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::market_stream::MarketStream;
use crate::parser::BinanceMarketTranslator;
use crate::user_data_stream::UserDataStream;

/// Both Binance sessions for one symbol behind a [`StreamConsumer`].
///
/// Market events go to `events`; trade matches and order status changes
/// go to `broker`, in the order the sockets delivered them.
pub struct BinanceStream {
    config: ConnectorConfig,
    rest: Arc<BinanceRestClient>,
    events: EventSender,
    broker: BrokerSender,
    metrics: SharedMetrics,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    user_data: bool,
    span: Span,
}

impl BinanceStream {
    pub fn new(
        config: ConnectorConfig,
        rest: Arc<BinanceRestClient>,
        events: EventSender,
        broker: BrokerSender,
        metrics: SharedMetrics,
    ) -> Self {
        let span = info_span!("binance_stream", symbol = %config.symbol());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            rest,
            events,
            broker,
            metrics,
            shutdown_tx,
            tasks: Vec::new(),
            user_data: true,
            span,
        }
    }

    /// Market data only, e.g. without API permissions for listen keys.
    pub fn without_user_data(mut self) -> Self {
        self.user_data = false;
        self
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    fn spawn<F>(&mut self, name: &'static str, session: F)
    where
        F: std::future::Future<Output = Result<(), ConnectorError>> + Send + 'static,
    {
        let span = self.span.clone();
        let task = async move {
            match session.await {
                Ok(()) => info!(session = name, "session finished"),
                Err(e) => error!(session = name, error = %e, "session ended with error"),
            }
        };
        self.tasks.push(tokio::spawn(task.instrument(span)));
    }
}

#[async_trait]
impl StreamConsumer for BinanceStream {
    /// Spawns the market session and, unless disabled, the user data
    /// session. Connecting and reconnecting happen inside those tasks.
    async fn start(&mut self) -> Result<(), ConnectorError> {
        if self.is_running() {
            warn!(parent: &self.span, "stream already running");
            return Ok(());
        }
        self.tasks.clear();
        self.shutdown_tx.send_replace(false);

        let gateway: Arc<dyn VenueGateway> = self.rest.clone();
        let market = MarketStream::new(
            &self.config,
            Box::new(BinanceMarketTranslator::new()),
            gateway,
            self.events.clone(),
            self.broker.clone(),
            Arc::clone(&self.metrics),
            self.span.clone(),
        )?;
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.spawn("market", market.run(shutdown_rx));

        if self.user_data {
            let user = UserDataStream::new(
                Arc::clone(&self.rest),
                self.broker.clone(),
                Arc::clone(&self.metrics),
                self.span.clone(),
            );
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.spawn("user_data", user.run(shutdown_rx));
        }

        info!(parent: &self.span, environment = ?self.config.environment, "stream started");
        Ok(())
    }

    fn stop(&self) {
        info!(parent: &self.span, "stopping stream");
        self.shutdown_tx.send_replace(true);
    }

    async fn join(&mut self) {
        let tasks: Vec<_> = self.tasks.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(parent: &self.span, error = %e, "stream task panicked or was aborted");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}
