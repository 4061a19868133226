//! Binance REST response bodies and their conversion to domain types.

use execution_core::{timestamp_from_millis, ExecutionInfo, Order, OrderSide, OrderType};
use model::Snapshot;
use rust_decimal::Decimal;
use serde::Deserialize;

/// GET /api/v3/time
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimeResponse {
    pub server_time: i64,
}

/// POST /api/v3/userDataStream
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKeyResponse {
    pub listen_key: String,
}

/// GET /api/v3/depth
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshotResponse {
    pub last_update_id: u64,
    /// `[price, quantity]` pairs, best first.
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

impl DepthSnapshotResponse {
    pub fn into_snapshot(self) -> Snapshot {
        Snapshot::from_levels(self.last_update_id, &self.bids, &self.asks)
    }
}

/// GET /api/v3/account
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    #[serde(default)]
    pub can_trade: bool,
    pub balances: Vec<AssetBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// POST /api/v3/order with `newOrderRespType=ACK`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponse {
    pub symbol: String,
    pub order_id: u64,
    pub client_order_id: String,
    pub transact_time: i64,
}

/// DELETE /api/v3/order
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderResponse {
    pub symbol: String,
    pub order_id: u64,
    pub status: String,
}

/// One entry of GET /api/v3/openOrders.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderResponse {
    pub symbol: String,
    pub order_id: u64,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub cummulative_quote_qty: Decimal,
    pub status: String,
    pub time_in_force: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    pub time: i64,
    pub update_time: i64,
}

impl OpenOrderResponse {
    /// Rebuilds the order. Prior fills become one execution at the average
    /// price with no fee. `None` for sides or types the connector cannot
    /// represent.
    pub fn into_order(self) -> Option<Order> {
        let side = OrderSide::from_binance_str(&self.side)?;
        let order_type = OrderType::from_binance_str(&self.order_type)?;

        let prior_fill = (self.executed_qty > Decimal::ZERO).then(|| {
            ExecutionInfo::new(
                self.cummulative_quote_qty / self.executed_qty,
                self.executed_qty,
                Decimal::ZERO,
                timestamp_from_millis(self.update_time),
            )
        });
        let price = (order_type != OrderType::Market).then_some(self.price);

        Some(Order::restored(
            self.order_id,
            self.symbol,
            side,
            order_type,
            price,
            self.orig_qty,
            prior_fill,
        ))
    }
}
