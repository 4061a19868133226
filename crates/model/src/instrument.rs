use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A base/quote pair. The venue symbol is the concatenation, e.g. `BTCUSDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Parses `BASE/QUOTE` or `BASE-QUOTE`.
impl FromStr for TradingPair {
    type Err = ParsePairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .or_else(|| s.split_once('-'))
            .ok_or_else(|| ParsePairError(s.to_string()))?;
        if base.is_empty() || quote.is_empty() {
            return Err(ParsePairError(s.to_string()));
        }
        Ok(Self::new(base.trim(), quote.trim()))
    }
}

#[derive(Debug, Clone)]
pub struct ParsePairError(String);

impl fmt::Display for ParsePairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trading pair '{}', expected BASE/QUOTE", self.0)
    }
}

impl std::error::Error for ParsePairError {}

/// Price and size granularity of an instrument.
///
/// Every price and size stored in a book or sent to a venue goes through
/// [`round_price`](Self::round_price) / [`round_size`](Self::round_size), so
/// repeated add/subtract on the same level cannot drift and equal values
/// always compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentTraits {
    pub price_increment: Decimal,
    pub size_increment: Decimal,
}

impl InstrumentTraits {
    pub fn new(price_increment: Decimal, size_increment: Decimal) -> Self {
        Self {
            price_increment,
            size_increment,
        }
    }

    /// `None` when the value is too large to round to the increment.
    pub fn round_price(&self, price: Decimal) -> Option<Decimal> {
        round_to_increment(price, self.price_increment)
    }

    pub fn round_size(&self, size: Decimal) -> Option<Decimal> {
        round_to_increment(size, self.size_increment)
    }
}

impl Default for InstrumentTraits {
    /// BTCUSDT spot filters.
    fn default() -> Self {
        Self::new(Decimal::new(1, 2), Decimal::new(1, 5))
    }
}

/// Banker's rounding to the nearest multiple of `increment`. A non-positive
/// increment only normalizes.
fn round_to_increment(value: Decimal, increment: Decimal) -> Option<Decimal> {
    if increment <= Decimal::ZERO {
        return Some(value.normalize());
    }
    let steps = value.checked_div(increment)?.round();
    Some(steps.checked_mul(increment)?.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_symbol_and_parse() {
        let pair: TradingPair = "btc/usdt".parse().unwrap();
        assert_eq!(pair.symbol(), "BTCUSDT");
        assert_eq!(pair.to_string(), "BTC/USDT");
        assert_eq!("ETH-BTC".parse::<TradingPair>().unwrap().base, "ETH");
        assert!("BTCUSDT".parse::<TradingPair>().is_err());
        assert!("/USDT".parse::<TradingPair>().is_err());
    }

    #[test]
    fn test_rounding_to_increments() {
        let traits = InstrumentTraits::new(dec!(0.01), dec!(0.001));
        assert_eq!(traits.round_price(dec!(100.126)), Some(dec!(100.13)));
        assert_eq!(traits.round_price(dec!(100.125)), Some(dec!(100.12)));
        assert_eq!(traits.round_size(dec!(0.0015)), Some(dec!(0.002)));
        assert_eq!(traits.round_size(dec!(1.5000)).unwrap().to_string(), "1.5");
    }

    #[test]
    fn test_coarse_increment() {
        let traits = InstrumentTraits::new(dec!(0.5), dec!(1));
        assert_eq!(traits.round_price(dec!(10.3)), Some(dec!(10.5)));
        assert_eq!(traits.round_size(dec!(2.4)), Some(dec!(2)));
    }

    #[test]
    fn test_rounding_overflow_is_none() {
        let traits = InstrumentTraits::new(dec!(0.01), dec!(0.0001));
        assert_eq!(traits.round_price(Decimal::MAX), None);
        assert_eq!(traits.round_size(Decimal::MAX), None);
        assert_eq!(traits.round_price(dec!(0.004)), Some(dec!(0)));
    }

    #[test]
    fn test_repeated_arithmetic_stays_canonical() {
        let traits = InstrumentTraits::default();
        let mut size = dec!(2.0);
        for _ in 0..10 {
            size = traits.round_size(size - dec!(0.1)).unwrap();
            size = traits.round_size(size + dec!(0.1)).unwrap();
        }
        assert_eq!(size, dec!(2));
    }
}
