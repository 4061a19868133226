//! Public market stream translation: `trade` and `depthUpdate` events,
//! raw or wrapped in a combined-stream envelope.

use connector_core::{ConnectorError, MessageTranslator, Translated};
use execution_core::{timestamp_from_millis, TradeMatch};
use model::{Delta, DeltaBatch, Exchange, Side, Trade, TradeDirection};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct BinanceTradeRaw {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    qty: Decimal,
    #[serde(rename = "b")]
    buyer_order_id: Option<u64>,
    #[serde(rename = "a")]
    seller_order_id: Option<u64>,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
struct BinanceDepthRaw {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(Decimal, Decimal)>,
    #[serde(rename = "a")]
    asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
struct CombinedStreamEnvelope {
    data: serde_json::Value,
}

impl BinanceTradeRaw {
    fn into_translated(self) -> Translated {
        let matched = (self.buyer_order_id.is_some() || self.seller_order_id.is_some()).then(|| {
            TradeMatch {
                sequence: self.trade_id,
                timestamp: timestamp_from_millis(self.trade_time),
                price: self.price,
                size: self.qty,
                buyer_order_id: self.buyer_order_id,
                seller_order_id: self.seller_order_id,
            }
        });
        let trade = Trade {
            exchange: Exchange::Binance,
            symbol: self.symbol,
            trade_id: self.trade_id,
            price: self.price,
            size: self.qty,
            timestamp_ms: self.trade_time,
            direction: TradeDirection::from_buyer_is_maker(self.is_buyer_maker),
            buyer_order_id: self.buyer_order_id,
            seller_order_id: self.seller_order_id,
        };
        Translated::Trade { trade, matched }
    }
}

impl From<BinanceDepthRaw> for DeltaBatch {
    /// Binance sends absolute level quantities, so every change is an
    /// `Assign` stamped with the batch's final update id.
    fn from(raw: BinanceDepthRaw) -> Self {
        let sequence = raw.final_update_id;
        let deltas = raw
            .bids
            .iter()
            .map(|(p, q)| Delta::assign(sequence, Side::Bid, *p, *q))
            .chain(
                raw.asks
                    .iter()
                    .map(|(p, q)| Delta::assign(sequence, Side::Ask, *p, *q)),
            )
            .collect();

        DeltaBatch {
            exchange: Exchange::Binance,
            symbol: raw.symbol,
            first_sequence: raw.first_update_id,
            final_sequence: raw.final_update_id,
            deltas,
            timestamp_ms: raw.event_time,
        }
    }
}

/// Translator for `<symbol>@trade` and `<symbol>@depth` streams.
#[derive(Debug, Clone, Default)]
pub struct BinanceMarketTranslator;

impl BinanceMarketTranslator {
    pub fn new() -> Self {
        Self
    }
}

impl MessageTranslator for BinanceMarketTranslator {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn supports_sequencing(&self) -> bool {
        true
    }

    fn translate(&self, text: &str) -> Result<Translated, ConnectorError> {
        let mut value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ConnectorError::Parse(e.to_string()))?;

        if value.get("stream").is_some() {
            let envelope: CombinedStreamEnvelope =
                serde_json::from_value(value).map_err(|e| ConnectorError::Parse(e.to_string()))?;
            value = envelope.data;
        }

        // Subscription acks look like {"result":null,"id":1}.
        if value.get("result").is_some() && value.get("id").is_some() {
            return Ok(Translated::Ignored);
        }

        let event_type = value
            .get("e")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::Parse("message has no event type".to_string()))?;

        match event_type {
            "trade" => serde_json::from_value::<BinanceTradeRaw>(value)
                .map(BinanceTradeRaw::into_translated)
                .map_err(|e| ConnectorError::Parse(format!("trade: {e}"))),
            "depthUpdate" => serde_json::from_value::<BinanceDepthRaw>(value)
                .map(|raw| Translated::Depth(raw.into()))
                .map_err(|e| ConnectorError::Parse(format!("depthUpdate: {e}"))),
            other => Err(ConnectorError::Parse(format!(
                "unexpected market event type '{other}'"
            ))),
        }
    }
}
