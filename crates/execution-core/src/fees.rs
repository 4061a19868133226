use rust_decimal::Decimal;

use crate::order::OrderType;

/// Fee charged on fills that arrive without a venue-reported commission.
///
/// Limit orders rest on the book and pay nothing; everything else pays
/// `taker_rate` of the notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub taker_rate: Decimal,
}

impl Default for FeeSchedule {
    /// 0.25%.
    fn default() -> Self {
        Self {
            taker_rate: Decimal::new(25, 4),
        }
    }
}

impl FeeSchedule {
    pub fn fee(&self, order_type: OrderType, price: Decimal, size: Decimal) -> Decimal {
        match order_type {
            OrderType::Limit => Decimal::ZERO,
            _ => self.taker_rate * price * size,
        }
    }
}
