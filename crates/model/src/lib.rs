//! Canonical market data types shared by every venue connector.
//!
//! Venue translators produce these; the book synchronizer, the order
//! registry and downstream subscribers consume them without any knowledge
//! of the venue's wire format.

mod book;
mod instrument;
mod trade;

use serde::{Deserialize, Serialize};

pub use book::{BookLevel, BookSnapshot, BookUpdate, Delta, DeltaBatch, DeltaKind, Side, Snapshot};
pub use instrument::{InstrumentTraits, ParsePairError, TradingPair};
pub use trade::{Trade, TradeDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Binance,
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exchange::Binance => write!(f, "binance"),
        }
    }
}

/// Events published to market data subscribers.
///
/// A `BookSnapshot` may arrive at any time (after a resync); subscribers
/// must treat it as a full replacement of whatever they hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    Trade(Trade),
    BookSnapshot(BookSnapshot),
    BookUpdate(BookUpdate),
}
