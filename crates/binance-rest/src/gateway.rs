use std::collections::HashMap;

use async_trait::async_trait;
use execution_core::{GatewayError, Order, OrderId, OrderSide, VenueGateway};
use model::Snapshot;
use rust_decimal::Decimal;

use crate::client::BinanceRestClient;

#[async_trait]
impl VenueGateway for BinanceRestClient {
    async fn balances(&self) -> Result<HashMap<String, Decimal>, GatewayError> {
        let account = self.get_account().await?;
        Ok(account
            .balances
            .into_iter()
            .map(|b| (b.asset, b.free))
            .collect())
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId, GatewayError> {
        let response =
            BinanceRestClient::place_limit_order(self, symbol, side, price, quantity).await?;
        Ok(response.order_id)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderId, GatewayError> {
        let response = BinanceRestClient::place_market_order(self, symbol, side, quantity).await?;
        Ok(response.order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: OrderId) -> Result<(), GatewayError> {
        BinanceRestClient::cancel_order(self, symbol, order_id).await?;
        Ok(())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<Order>, GatewayError> {
        let responses = self.get_open_orders(symbol).await?;
        let total = responses.len();
        let orders: Vec<Order> = responses
            .into_iter()
            .filter_map(|r| r.into_order())
            .collect();
        if orders.len() < total {
            tracing::warn!(
                symbol,
                skipped = total - orders.len(),
                "Open orders with unsupported side or type were skipped"
            );
        }
        Ok(orders)
    }

    async fn snapshot(&self, symbol: &str) -> Result<Snapshot, GatewayError> {
        let response = self.get_depth_snapshot(symbol, self.depth_limit()).await?;
        Ok(response.into_snapshot())
    }
}
