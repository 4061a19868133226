//! Order book error types.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum OrderBookError {
    /// Non-positive price on a delta.
    #[error("invalid price: {0}")]
    InvalidPrice(Decimal),

    /// Negative size on a delta.
    #[error("invalid size {size} at price {price}")]
    InvalidSize { price: Decimal, size: Decimal },

    /// Value too large to round to the instrument increment or to add to a level.
    #[error("{field} {value} overflows the book's decimal range")]
    Overflow { field: &'static str, value: Decimal },

    /// Snapshots may only carry `Assign` deltas.
    #[error("snapshot {sequence} contains a non-assign delta")]
    NonAssignInSnapshot { sequence: u64 },
}
