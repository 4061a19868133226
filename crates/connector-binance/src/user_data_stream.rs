//! User data stream: order status changes for the account.
//!
//! Owns the listen key lifecycle (create, keep alive every 30 minutes, close
//! on shutdown) and reconnects with backoff.

use std::sync::Arc;
use std::time::Duration;

use binance_rest::{BinanceRestClient, BinanceRestError};
use common::ExponentialBackoff;
use connector_core::{BrokerSender, ConnectorError, MessageTranslator, Translated};
use execution_core::BrokerMessage;
use futures_util::{SinkExt, StreamExt};
use metrics::SharedMetrics;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn, Span};

use crate::session::{
    connect_with_timeout, pong, shutdown_requested, wait_backoff, ConnectResult,
};
use crate::user_data_parser::BinanceUserDataTranslator;

/// Keys expire after 60 minutes; refresh at half that.
const LISTEN_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

enum UserSessionResult {
    Shutdown,
    Error(ConnectorError),
    /// The key expired or the server closed the stream; get a new key.
    ListenKeyExpired,
}

pub(crate) struct UserDataStream {
    rest: Arc<BinanceRestClient>,
    translator: BinanceUserDataTranslator,
    broker: BrokerSender,
    metrics: SharedMetrics,
    span: Span,
}

impl UserDataStream {
    pub(crate) fn new(
        rest: Arc<BinanceRestClient>,
        broker: BrokerSender,
        metrics: SharedMetrics,
        span: Span,
    ) -> Self {
        Self {
            rest,
            translator: BinanceUserDataTranslator::new(),
            broker,
            metrics,
            span,
        }
    }

    pub(crate) async fn run(
        self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let mut backoff = ExponentialBackoff::default();

        loop {
            if *shutdown_rx.borrow() {
                info!(parent: &self.span, "shutdown requested, exiting user data stream");
                return Ok(());
            }

            let listen_key = match self.rest.create_listen_key().await {
                Ok(key) => {
                    backoff.reset();
                    key
                }
                Err(e) => {
                    warn!(parent: &self.span, error = %e, "failed to create listen key");
                    self.metrics.inc_connection_failures();
                    if !wait_backoff(&mut backoff, &mut shutdown_rx).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            info!(parent: &self.span, "listen key created, connecting to user data stream");

            match self.run_session(&listen_key, &mut shutdown_rx).await {
                UserSessionResult::Shutdown => {
                    if let Err(e) = self.rest.close_listen_key(&listen_key).await {
                        warn!(parent: &self.span, error = %e, "failed to close listen key during shutdown");
                    }
                    return Ok(());
                }
                UserSessionResult::Error(ConnectorError::ChannelClosed) => {
                    info!(parent: &self.span, "broker channel closed, exiting user data stream");
                    return Err(ConnectorError::ChannelClosed);
                }
                UserSessionResult::Error(e) => {
                    warn!(parent: &self.span, error = %e, "user data session error, reconnecting");
                    self.metrics.inc_reconnect_attempts();
                    if !wait_backoff(&mut backoff, &mut shutdown_rx).await {
                        return Ok(());
                    }
                }
                UserSessionResult::ListenKeyExpired => {
                    info!(parent: &self.span, "listen key expired, creating a new one");
                    self.metrics.inc_reconnect_attempts();
                }
            }
        }
    }

    async fn run_session(
        &self,
        listen_key: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> UserSessionResult {
        let url = self.rest.environment().ws_stream_url(listen_key);

        let ws_stream = match connect_with_timeout(&url, shutdown_rx).await {
            ConnectResult::Connected(stream) => stream,
            ConnectResult::Shutdown => return UserSessionResult::Shutdown,
            ConnectResult::Error(e) => return UserSessionResult::Error(e),
        };

        info!(parent: &self.span, "user data stream connected");
        self.metrics.inc_reconnect_successes();

        let (mut write, mut read) = ws_stream.split();
        let mut keepalive = tokio::time::interval(LISTEN_KEY_REFRESH_INTERVAL);
        // The first tick fires immediately.
        keepalive.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if shutdown_requested(changed, shutdown_rx) {
                        info!(parent: &self.span, "closing user data stream");
                        let _ = write.close().await;
                        return UserSessionResult::Shutdown;
                    }
                }

                _ = keepalive.tick() => {
                    match self.rest.keepalive_listen_key(listen_key).await {
                        Ok(()) => debug!(parent: &self.span, "listen key refreshed"),
                        Err(BinanceRestError::ListenKeyExpired) => {
                            warn!(parent: &self.span, "listen key expired during refresh");
                            return UserSessionResult::ListenKeyExpired;
                        }
                        // Retried on the next tick; the key is still valid for a while.
                        Err(e) => warn!(parent: &self.span, error = %e, "failed to refresh listen key"),
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_text(&text).await {
                                return UserSessionResult::Error(e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = pong(&mut write, data).await {
                                self.metrics.inc_websocket_errors();
                                return UserSessionResult::Error(e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(parent: &self.span, "user data stream closed by server");
                            return UserSessionResult::ListenKeyExpired;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(parent: &self.span, error = %e, "user data socket error");
                            self.metrics.inc_websocket_errors();
                            return UserSessionResult::Error(ConnectorError::WebSocket(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Forwards status changes to the broker. Malformed frames are dropped.
    async fn handle_text(&self, text: &str) -> Result<(), ConnectorError> {
        self.metrics.inc_messages_received();

        match self.translator.translate(text) {
            Ok(Translated::StatusChange(change)) => {
                debug!(
                    parent: &self.span,
                    order_id = change.order_id,
                    state = ?change.new_state,
                    "order status change"
                );
                self.metrics.inc_status_changes();
                self.broker
                    .send(BrokerMessage::StatusChange(change))
                    .await
                    .map_err(|_| ConnectorError::ChannelClosed)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.metrics.inc_parse_errors();
                warn!(parent: &self.span, error = %e, "dropping malformed user data message");
                Ok(())
            }
        }
    }
}
