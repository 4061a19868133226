//! Binance environment selection (production or testnet).

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinanceEnvironment {
    /// Real money.
    #[default]
    Production,
    Testnet,
}

impl BinanceEnvironment {
    pub fn rest_base_url(&self) -> &'static str {
        match self {
            Self::Production => "https://api.binance.com",
            Self::Testnet => "https://testnet.binance.vision",
        }
    }

    pub fn ws_base_url(&self) -> &'static str {
        match self {
            Self::Production => "wss://stream.binance.com:9443",
            Self::Testnet => "wss://stream.testnet.binance.vision:9443",
        }
    }

    /// Raw (single stream) WebSocket URL, e.g. for a user data listen key.
    pub fn ws_stream_url(&self, stream: &str) -> String {
        format!("{}/ws/{}", self.ws_base_url(), stream)
    }

    /// Combined-stream WebSocket URL for several subscriptions.
    pub fn ws_combined_url(&self, streams: &[String]) -> String {
        format!("{}/stream?streams={}", self.ws_base_url(), streams.join("/"))
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Reads `BINANCE_ENVIRONMENT`; unset or unparseable means production.
    pub fn from_env() -> Self {
        std::env::var("BINANCE_ENVIRONMENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for BinanceEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Testnet => write!(f, "testnet"),
        }
    }
}

impl FromStr for BinanceEnvironment {
    type Err = ParseEnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" | "mainnet" | "main" => Ok(Self::Production),
            "testnet" | "test" | "sandbox" => Ok(Self::Testnet),
            _ => Err(ParseEnvironmentError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseEnvironmentError(String);

impl fmt::Display for ParseEnvironmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid environment '{}', expected 'production' or 'testnet'",
            self.0
        )
    }
}

impl std::error::Error for ParseEnvironmentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_per_environment() {
        assert_eq!(
            BinanceEnvironment::Production.rest_base_url(),
            "https://api.binance.com"
        );
        assert_eq!(
            BinanceEnvironment::Testnet.rest_base_url(),
            "https://testnet.binance.vision"
        );
        assert!(BinanceEnvironment::Production.is_production());
        assert!(!BinanceEnvironment::Testnet.is_production());
    }

    #[test]
    fn test_stream_urls() {
        let env = BinanceEnvironment::Production;
        assert_eq!(
            env.ws_stream_url("abc123"),
            "wss://stream.binance.com:9443/ws/abc123"
        );
        assert_eq!(
            env.ws_combined_url(&["btcusdt@trade".to_string(), "btcusdt@depth@100ms".to_string()]),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/btcusdt@depth@100ms"
        );
    }

    #[test]
    fn test_parse_aliases() {
        for s in ["production", "prod", "MAINNET", " main "] {
            assert_eq!(
                s.parse::<BinanceEnvironment>().unwrap(),
                BinanceEnvironment::Production
            );
        }
        for s in ["testnet", "test", "SANDBOX"] {
            assert_eq!(
                s.parse::<BinanceEnvironment>().unwrap(),
                BinanceEnvironment::Testnet
            );
        }
        assert!("staging".parse::<BinanceEnvironment>().is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for env in [BinanceEnvironment::Production, BinanceEnvironment::Testnet] {
            assert_eq!(env.to_string().parse::<BinanceEnvironment>().unwrap(), env);
        }
    }
}
