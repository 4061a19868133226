//! Order book with sorted, canonicalized price levels.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use model::{BookLevel, BookSnapshot, Delta, DeltaKind, Exchange, InstrumentTraits, Side, Snapshot};
use rust_decimal::Decimal;
use tracing::warn;

use crate::error::OrderBookError;

/// Local order book for one instrument.
///
/// - Bids use `Reverse<Decimal>` keys so iteration yields the highest price first.
/// - Asks use `Decimal` keys so iteration yields the lowest price first.
///
/// Prices and sizes are rounded to the instrument's increments before they
/// are stored. No level is ever stored with a zero or negative size, and the
/// book's sequence never moves backwards.
#[derive(Debug, Clone)]
pub struct OrderBook {
    exchange: Exchange,
    symbol: String,
    traits: InstrumentTraits,
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    sequence: Option<u64>,
}

impl OrderBook {
    pub fn new(exchange: Exchange, symbol: impl Into<String>, traits: InstrumentTraits) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            traits,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: None,
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn traits(&self) -> &InstrumentTraits {
        &self.traits
    }

    /// Sequence of the last snapshot or delta applied; `None` until the first one.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn is_initialized(&self) -> bool {
        self.sequence.is_some()
    }

    /// Applies one delta.
    ///
    /// `Decrease` below zero removes the level and logs; a negative input size,
    /// a non-positive price or a value that overflows when rounded is rejected
    /// without touching the book.
    pub fn apply(&mut self, delta: &Delta) -> Result<(), OrderBookError> {
        let (price, size) = self.rounded(delta)?;
        let current = self.level_size(delta.side, price).unwrap_or(Decimal::ZERO);

        let next = match delta.kind {
            DeltaKind::Assign => size,
            DeltaKind::Increase => current.checked_add(size).ok_or(OrderBookError::Overflow {
                field: "size",
                value: size,
            })?,
            DeltaKind::Decrease => {
                let remaining = current - size;
                if remaining < Decimal::ZERO {
                    warn!(
                        symbol = %self.symbol,
                        side = ?delta.side,
                        price = %price,
                        level = %current,
                        decrease = %size,
                        sequence = delta.sequence,
                        "decrease exceeds level size, clamping to zero"
                    );
                    Decimal::ZERO
                } else {
                    remaining
                }
            }
        };
        let next = self.traits.round_size(next).ok_or(OrderBookError::Overflow {
            field: "size",
            value: next,
        })?;

        self.set_level(delta.side, price, next);
        self.advance_sequence(delta.sequence);
        Ok(())
    }

    /// Checks that `delta` could be stored, without applying it.
    pub fn validate(&self, delta: &Delta) -> Result<(), OrderBookError> {
        self.rounded(delta).map(|_| ())
    }

    /// Replaces both sides with the snapshot's levels.
    ///
    /// The snapshot is validated before anything is cleared, so a rejected
    /// snapshot leaves the book untouched. Applying the same snapshot twice
    /// yields the same book.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), OrderBookError> {
        let mut levels = Vec::with_capacity(snapshot.deltas.len());
        for delta in &snapshot.deltas {
            if delta.kind != DeltaKind::Assign {
                return Err(OrderBookError::NonAssignInSnapshot {
                    sequence: snapshot.sequence,
                });
            }
            let (price, size) = self.rounded(delta)?;
            levels.push((delta.side, price, size));
        }

        self.bids.clear();
        self.asks.clear();
        for (side, price, size) in levels {
            self.set_level(side, price, size);
        }

        // A snapshot is authoritative, even if older than what we had.
        self.sequence = Some(snapshot.sequence);
        Ok(())
    }

    /// Moves the sequence forward to `sequence`; never backwards.
    pub fn advance_sequence(&mut self, sequence: u64) {
        self.sequence = Some(self.sequence.map_or(sequence, |s| s.max(sequence)));
    }

    /// Full ordered view: bids descending, asks ascending.
    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            exchange: self.exchange,
            symbol: self.symbol.clone(),
            sequence: self.sequence.unwrap_or(0),
            bids: self.top_bids(usize::MAX),
            asks: self.top_asks(usize::MAX),
        }
    }

    pub fn level_size(&self, side: Side, price: Decimal) -> Option<Decimal> {
        match side {
            Side::Bid => self.bids.get(&Reverse(price)).copied(),
            Side::Ask => self.asks.get(&price).copied(),
        }
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids
            .iter()
            .next()
            .map(|(Reverse(price), size)| BookLevel::new(*price, *size))
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks
            .iter()
            .next()
            .map(|(price, size)| BookLevel::new(*price, *size))
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid.price + ask.price) / Decimal::TWO)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    pub fn top_bids(&self, n: usize) -> Vec<BookLevel> {
        self.bids
            .iter()
            .take(n)
            .map(|(Reverse(price), size)| BookLevel::new(*price, *size))
            .collect()
    }

    pub fn top_asks(&self, n: usize) -> Vec<BookLevel> {
        self.asks
            .iter()
            .take(n)
            .map(|(price, size)| BookLevel::new(*price, *size))
            .collect()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Drops all levels and returns to the uninitialized state.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.sequence = None;
    }

    fn rounded(&self, delta: &Delta) -> Result<(Decimal, Decimal), OrderBookError> {
        check_delta(delta)?;
        let price = self.traits.round_price(delta.price).ok_or(OrderBookError::Overflow {
            field: "price",
            value: delta.price,
        })?;
        let size = self.traits.round_size(delta.size).ok_or(OrderBookError::Overflow {
            field: "size",
            value: delta.size,
        })?;
        Ok((price, size))
    }

    fn set_level(&mut self, side: Side, price: Decimal, size: Decimal) {
        let remove = size <= Decimal::ZERO;
        match side {
            Side::Bid if remove => {
                self.bids.remove(&Reverse(price));
            }
            Side::Bid => {
                self.bids.insert(Reverse(price), size);
            }
            Side::Ask if remove => {
                self.asks.remove(&price);
            }
            Side::Ask => {
                self.asks.insert(price, size);
            }
        }
    }
}

fn check_delta(delta: &Delta) -> Result<(), OrderBookError> {
    if delta.price <= Decimal::ZERO {
        return Err(OrderBookError::InvalidPrice(delta.price));
    }
    if delta.size < Decimal::ZERO {
        return Err(OrderBookError::InvalidSize {
            price: delta.price,
            size: delta.size,
        });
    }
    Ok(())
}
