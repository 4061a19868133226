use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::Exchange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// How a delta's size combines with the level already in the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    /// Replace the level's size outright; zero removes the level.
    Assign,
    /// Add to the level, creating it if absent.
    Increase,
    /// Subtract from the level, removing it once it reaches zero.
    Decrease,
}

/// A single sequenced change to one price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub sequence: u64,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub kind: DeltaKind,
}

impl Delta {
    pub fn new(sequence: u64, side: Side, price: Decimal, size: Decimal, kind: DeltaKind) -> Self {
        Self {
            sequence,
            side,
            price,
            size,
            kind,
        }
    }

    pub fn assign(sequence: u64, side: Side, price: Decimal, size: Decimal) -> Self {
        Self::new(sequence, side, price, size, DeltaKind::Assign)
    }

    pub fn increase(sequence: u64, side: Side, price: Decimal, size: Decimal) -> Self {
        Self::new(sequence, side, price, size, DeltaKind::Increase)
    }

    pub fn decrease(sequence: u64, side: Side, price: Decimal, size: Decimal) -> Self {
        Self::new(sequence, side, price, size, DeltaKind::Decrease)
    }
}

/// Deltas delivered by one venue message, tagged with the update-id range
/// `[first_sequence, final_sequence]` the message covers.
///
/// Venues that sequence every change individually produce single-delta
/// batches with `first_sequence == final_sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub exchange: Exchange,
    pub symbol: String,
    pub first_sequence: u64,
    pub final_sequence: u64,
    pub deltas: Vec<Delta>,
    pub timestamp_ms: i64,
}

impl DeltaBatch {
    /// Wraps one individually sequenced delta.
    pub fn single(
        exchange: Exchange,
        symbol: impl Into<String>,
        delta: Delta,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            first_sequence: delta.sequence,
            final_sequence: delta.sequence,
            deltas: vec![delta],
            timestamp_ms,
        }
    }
}

/// Complete book state as of `sequence`. Every delta is `Assign`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub deltas: Vec<Delta>,
}

impl Snapshot {
    /// Builds a snapshot from `(price, size)` pairs as returned by a REST
    /// depth endpoint.
    pub fn from_levels(
        sequence: u64,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
    ) -> Self {
        let deltas = bids
            .iter()
            .map(|(p, s)| Delta::assign(sequence, Side::Bid, *p, *s))
            .chain(
                asks.iter()
                    .map(|(p, s)| Delta::assign(sequence, Side::Ask, *p, *s)),
            )
            .collect();
        Self { sequence, deltas }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Full, ordered view of the book: bids best (highest) first, asks best
/// (lowest) first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub exchange: Exchange,
    pub symbol: String,
    pub sequence: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }
}

/// An incremental change that was applied to a live book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookUpdate {
    pub exchange: Exchange,
    pub symbol: String,
    pub first_sequence: u64,
    pub final_sequence: u64,
    pub deltas: Vec<Delta>,
    /// Top of book after the update.
    pub best_bid: Option<BookLevel>,
    pub best_ask: Option<BookLevel>,
    pub timestamp_ms: i64,
}
