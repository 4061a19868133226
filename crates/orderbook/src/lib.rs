//! Local order book and the stream synchronizer that keeps it consistent.
//!
//! [`OrderBook`] is a plain price-level map. [`BookSynchronizer`] owns one
//! and reconciles a REST snapshot with the venue's incremental stream, so
//! the book is either unavailable or consistent as of some sequence.
//!
//! # Example
//!
//! ```rust
//! use model::{Delta, Exchange, InstrumentTraits, Side, Snapshot};
//! use orderbook::OrderBook;
//! use rust_decimal_macros::dec;
//!
//! let mut book = OrderBook::new(Exchange::Binance, "BTCUSDT", InstrumentTraits::default());
//! let snapshot = Snapshot::from_levels(500, &[(dec!(100), dec!(2))], &[(dec!(101), dec!(1))]);
//! book.apply_snapshot(&snapshot).unwrap();
//! book.apply(&Delta::decrease(501, Side::Bid, dec!(100), dec!(0.5))).unwrap();
//!
//! assert_eq!(book.best_bid().unwrap().size, dec!(1.5));
//! ```

mod book;
mod error;
mod synchronizer;

pub use book::OrderBook;
pub use error::OrderBookError;
pub use synchronizer::{
    BookSynchronizer, SequencePolicy, SnapshotOutcome, SnapshotRequest, SyncOutcome,
    SynchronizerConfig, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_PROTOCOL_VIOLATIONS,
};
