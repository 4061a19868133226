//! User data stream translation.
//!
//! `executionReport` becomes an [`OrderStatusChange`]. Balance pushes are
//! recognised and dropped; the registry refreshes balances over REST.

use connector_core::{ConnectorError, MessageTranslator, Translated};
use execution_core::{timestamp_from_millis, CumulativeFill, OrderState, OrderStatusChange};
use model::Exchange;
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct BinanceExecutionReportRaw {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "i")]
    order_id: u64,
    /// Execution type: NEW, CANCELED, REPLACED, REJECTED, TRADE, EXPIRED.
    #[serde(rename = "x")]
    execution_type: String,
    #[serde(rename = "X")]
    order_status: String,
    /// Last executed quantity.
    #[serde(rename = "l")]
    last_executed_qty: Decimal,
    #[serde(rename = "z")]
    cumulative_filled_qty: Decimal,
    #[serde(rename = "L")]
    last_executed_price: Decimal,
    #[serde(rename = "n")]
    commission: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
    /// -1 when the report carries no trade.
    #[serde(rename = "t")]
    trade_id: i64,
}

/// Order statuses with no lifecycle meaning here.
const PASSIVE_STATUSES: &[&str] = &["PENDING_CANCEL", "PENDING_NEW"];

impl TryFrom<BinanceExecutionReportRaw> for OrderStatusChange {
    type Error = ConnectorError;

    fn try_from(raw: BinanceExecutionReportRaw) -> Result<Self, Self::Error> {
        let new_state = match OrderState::from_binance_str(&raw.order_status) {
            Some(state) => Some(state),
            None if PASSIVE_STATUSES.contains(&raw.order_status.as_str()) => None,
            None => {
                return Err(ConnectorError::Parse(format!(
                    "unknown order status '{}'",
                    raw.order_status
                )))
            }
        };

        let fill = (raw.execution_type == "TRADE" && raw.last_executed_qty > Decimal::ZERO).then(
            || CumulativeFill {
                price: raw.last_executed_price,
                cumulative_filled: raw.cumulative_filled_qty,
                fee: raw.commission,
                timestamp: timestamp_from_millis(raw.trade_time),
                trade_id: u64::try_from(raw.trade_id).ok(),
            },
        );

        Ok(OrderStatusChange {
            order_id: raw.order_id,
            new_state,
            fill,
            event_time_ms: raw.event_time,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct BinanceUserDataTranslator;

impl BinanceUserDataTranslator {
    pub fn new() -> Self {
        Self
    }
}

impl MessageTranslator for BinanceUserDataTranslator {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    /// The user data stream carries no book deltas.
    fn supports_sequencing(&self) -> bool {
        false
    }

    fn translate(&self, text: &str) -> Result<Translated, ConnectorError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ConnectorError::Parse(e.to_string()))?;

        match value.get("e").and_then(|v| v.as_str()) {
            Some("executionReport") => {
                let raw: BinanceExecutionReportRaw = serde_json::from_value(value)
                    .map_err(|e| ConnectorError::Parse(format!("executionReport: {e}")))?;
                Ok(Translated::StatusChange(raw.try_into()?))
            }
            Some("outboundAccountPosition") | Some("balanceUpdate") | Some("listStatus") => {
                Ok(Translated::Ignored)
            }
            Some(other) => Err(ConnectorError::Parse(format!(
                "unexpected user data event type '{other}'"
            ))),
            None => Err(ConnectorError::Parse(
                "message has no event type".to_string(),
            )),
        }
    }
}
