use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::Exchange;

/// Aggressor direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    /// The buyer took liquidity.
    Up,
    /// The buyer was the resting maker, so the seller took liquidity.
    Down,
}

impl TradeDirection {
    pub fn from_buyer_is_maker(buyer_is_maker: bool) -> Self {
        if buyer_is_maker {
            TradeDirection::Down
        } else {
            TradeDirection::Up
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: Exchange,
    pub symbol: String,
    pub trade_id: u64,
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp_ms: i64,
    pub direction: TradeDirection,
    /// Venue order ids on each side, when the venue discloses them.
    pub buyer_order_id: Option<u64>,
    pub seller_order_id: Option<u64>,
}
