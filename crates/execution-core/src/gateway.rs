//! Venue REST surface used by the registry and the synchronizer.

use std::collections::HashMap;

use async_trait::async_trait;
use model::Snapshot;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::order::{Order, OrderId, OrderSide};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network trouble, timeouts, rate limits. Safe to retry.
    #[error("transient: {0}")]
    Transient(String),

    /// The venue understood and refused the request.
    #[error("rejected by venue: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Signed, venue-specific REST calls.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    /// Free balance per asset.
    async fn balances(&self) -> Result<HashMap<String, Decimal>, GatewayError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<OrderId, GatewayError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderId, GatewayError>;

    async fn cancel_order(&self, symbol: &str, order_id: OrderId) -> Result<(), GatewayError>;

    /// Orders still open at the venue.
    async fn open_orders(&self, symbol: &str) -> Result<Vec<Order>, GatewayError>;

    /// Full depth snapshot.
    async fn snapshot(&self, symbol: &str) -> Result<Snapshot, GatewayError>;
}
