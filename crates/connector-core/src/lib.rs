//! Venue-neutral plumbing shared by exchange connectors: errors, settings,
//! channels and the seams a venue implementation plugs into.

mod config;

use async_trait::async_trait;
use execution_core::{BrokerMessage, OrderStatusChange, TradeMatch};
use model::{DeltaBatch, Exchange, MarketEvent, Trade};
use thiserror::Error;
use tokio::sync::mpsc;

pub use config::ConnectorConfig;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("{0} does not tag depth updates with sequence numbers")]
    UnsupportedVenue(Exchange),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type EventSender = mpsc::Sender<MarketEvent>;
pub type EventReceiver = mpsc::Receiver<MarketEvent>;

pub fn create_event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity)
}

/// Trade matches and order-status pushes headed for the dispatch loop.
pub type BrokerSender = mpsc::Sender<BrokerMessage>;
pub type BrokerReceiver = mpsc::Receiver<BrokerMessage>;

pub fn create_broker_channel(capacity: usize) -> (BrokerSender, BrokerReceiver) {
    mpsc::channel(capacity)
}

/// A streaming session with its own reconnection policy.
///
/// `start` connects and spawns the session; it returns once the session is
/// running. `stop` only signals, `join` waits for the tasks to finish.
#[async_trait]
pub trait StreamConsumer: Send {
    async fn start(&mut self) -> Result<(), ConnectorError>;

    fn stop(&self);

    async fn join(&mut self);

    fn is_running(&self) -> bool;
}

/// A venue message in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum Translated {
    Depth(DeltaBatch),
    /// `matched` is set when the venue names the orders on either side.
    Trade {
        trade: Trade,
        matched: Option<TradeMatch>,
    },
    StatusChange(OrderStatusChange),
    /// Recognised but carries nothing the connector uses.
    Ignored,
}

/// Turns raw venue text frames into [`Translated`] values.
///
/// An `Err` means the frame was not understood. Callers drop it and count it
/// as a protocol violation.
pub trait MessageTranslator: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Whether depth messages carry `(first, final)` update ids.
    fn supports_sequencing(&self) -> bool;

    fn translate(&self, text: &str) -> Result<Translated, ConnectorError>;
}

/// Refuses translators that cannot drive a book synchronizer.
pub fn require_sequencing(translator: &dyn MessageTranslator) -> Result<(), ConnectorError> {
    if translator.supports_sequencing() {
        Ok(())
    } else {
        Err(ConnectorError::UnsupportedVenue(translator.exchange()))
    }
}
