//! Connector settings loaded from the environment.

use std::str::FromStr;

use common::BinanceEnvironment;
use model::{InstrumentTraits, TradingPair};
use orderbook::{
    SequencePolicy, SynchronizerConfig, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_PROTOCOL_VIOLATIONS,
};
use rust_decimal::Decimal;

use crate::ConnectorError;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// The single pair this connector trades and tracks.
    pub pair: TradingPair,
    /// Binance environment (production or testnet).
    pub environment: BinanceEnvironment,
    pub traits: InstrumentTraits,
    /// Levels requested per side in REST depth snapshots.
    pub depth_limit: u32,
    /// Diff-depth push interval, 100 or 1000.
    pub depth_speed_ms: u32,
    /// Market event channel capacity.
    pub channel_capacity: usize,
    /// Trade-match / order-status channel capacity.
    pub broker_channel_capacity: usize,
    /// Batches held while waiting for a snapshot.
    pub buffer_capacity: usize,
    pub gap_tolerance: u64,
    pub max_protocol_violations: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            pair: TradingPair::new("BTC", "USDT"),
            environment: BinanceEnvironment::Testnet,
            traits: InstrumentTraits::default(),
            depth_limit: 1000,
            depth_speed_ms: 100,
            channel_capacity: 1024,
            broker_channel_capacity: 1024,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            gap_tolerance: 0,
            max_protocol_violations: DEFAULT_MAX_PROTOCOL_VIOLATIONS,
        }
    }
}

impl ConnectorConfig {
    /// Reads `BINANCE_*` variables, falling back to defaults for anything
    /// unset. A `.env` file is loaded first if present.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `BINANCE_BASE_ASSET` / `BINANCE_QUOTE_ASSET` | `BTC` / `USDT` |
    /// | `BINANCE_ENVIRONMENT` | `testnet` |
    /// | `BINANCE_PRICE_INCREMENT` / `BINANCE_SIZE_INCREMENT` | `0.01` / `0.00001` |
    /// | `BINANCE_DEPTH_LIMIT` | `1000` |
    /// | `BINANCE_DEPTH_SPEED_MS` | `100` |
    /// | `BINANCE_CHANNEL_CAPACITY` | `1024` |
    /// | `BINANCE_BUFFER_CAPACITY` | `1000` |
    /// | `BINANCE_GAP_TOLERANCE` | `0` |
    pub fn from_env() -> Result<Self, ConnectorError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConnectorError> {
        let defaults = Self::default();

        let base = lookup("BINANCE_BASE_ASSET").unwrap_or(defaults.pair.base);
        let quote = lookup("BINANCE_QUOTE_ASSET").unwrap_or(defaults.pair.quote);
        let environment = match lookup("BINANCE_ENVIRONMENT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| ConnectorError::Config(format!("BINANCE_ENVIRONMENT: {e}")))?,
            None => defaults.environment,
        };

        let depth_speed_ms = parse_or(&lookup, "BINANCE_DEPTH_SPEED_MS", defaults.depth_speed_ms)?;
        if depth_speed_ms != 100 && depth_speed_ms != 1000 {
            return Err(ConnectorError::Config(format!(
                "BINANCE_DEPTH_SPEED_MS must be 100 or 1000, got {depth_speed_ms}"
            )));
        }

        let channel_capacity =
            parse_or(&lookup, "BINANCE_CHANNEL_CAPACITY", defaults.channel_capacity)?;

        Ok(Self {
            pair: TradingPair::new(base, quote),
            environment,
            traits: InstrumentTraits::new(
                parse_or::<Decimal>(&lookup, "BINANCE_PRICE_INCREMENT", defaults.traits.price_increment)?,
                parse_or::<Decimal>(&lookup, "BINANCE_SIZE_INCREMENT", defaults.traits.size_increment)?,
            ),
            depth_limit: parse_or(&lookup, "BINANCE_DEPTH_LIMIT", defaults.depth_limit)?,
            depth_speed_ms,
            channel_capacity,
            broker_channel_capacity: channel_capacity,
            buffer_capacity: parse_or(&lookup, "BINANCE_BUFFER_CAPACITY", defaults.buffer_capacity)?,
            gap_tolerance: parse_or(&lookup, "BINANCE_GAP_TOLERANCE", defaults.gap_tolerance)?,
            max_protocol_violations: defaults.max_protocol_violations,
        })
    }

    pub fn symbol(&self) -> String {
        self.pair.symbol()
    }

    /// Binance depth updates chain by `U == previous u + 1`.
    pub fn synchronizer_config(&self) -> SynchronizerConfig {
        SynchronizerConfig {
            policy: SequencePolicy::Contiguous {
                gap_tolerance: self.gap_tolerance,
            },
            buffer_capacity: self.buffer_capacity,
            max_protocol_violations: self.max_protocol_violations,
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConnectorError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConnectorError::Config(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}
