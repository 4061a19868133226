//! Binance REST API client.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use common::BinanceEnvironment;
use execution_core::{OrderSide, OrderType, TimeInForce};
use reqwest::Method;
use rust_decimal::Decimal;

use crate::error::BinanceRestError;
use crate::http::HttpClient;
use crate::responses::{
    AccountResponse, CancelOrderResponse, DepthSnapshotResponse, ListenKeyResponse,
    NewOrderResponse, OpenOrderResponse, ServerTimeResponse,
};
use crate::signing::{ApiCredentials, RequestSigner, DEFAULT_RECV_WINDOW_MS};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DEPTH_LIMIT: u32 = 1000;

/// Signed client for the spot REST API.
///
/// The HTTP session is built once at construction and reused for every call.
pub struct BinanceRestClient {
    http: HttpClient,
    credentials: ApiCredentials,
    environment: BinanceEnvironment,
    /// Local clock minus server clock.
    time_offset_ms: AtomicI64,
    recv_window_ms: u64,
    depth_limit: u32,
}

impl BinanceRestClient {
    pub fn new(credentials: ApiCredentials) -> Result<Self, BinanceRestError> {
        Self::with_environment(credentials, BinanceEnvironment::Production)
    }

    pub fn with_environment(
        credentials: ApiCredentials,
        environment: BinanceEnvironment,
    ) -> Result<Self, BinanceRestError> {
        let http = HttpClient::new(environment.rest_base_url(), REQUEST_TIMEOUT)?;

        Ok(Self {
            http,
            credentials,
            environment,
            time_offset_ms: AtomicI64::new(0),
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            depth_limit: DEFAULT_DEPTH_LIMIT,
        })
    }

    /// Levels per side requested by [`VenueGateway::snapshot`](execution_core::VenueGateway::snapshot).
    pub fn with_depth_limit(mut self, depth_limit: u32) -> Self {
        self.depth_limit = depth_limit;
        self
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    pub fn environment(&self) -> BinanceEnvironment {
        self.environment
    }

    pub fn depth_limit(&self) -> u32 {
        self.depth_limit
    }

    /// Local time corrected by the last [`sync_time`](Self::sync_time).
    pub fn server_timestamp_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.time_offset_ms.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Time Synchronization
    // ========================================================================

    pub async fn sync_time(&self) -> Result<(), BinanceRestError> {
        let before = Instant::now();
        let response: ServerTimeResponse = self
            .http
            .request(Method::GET, "/api/v3/time", None, None)
            .await?;
        let rtt = before.elapsed().as_millis() as i64;

        let local_time = chrono::Utc::now().timestamp_millis();
        let offset = local_time - (response.server_time + rtt / 2);
        self.time_offset_ms.store(offset, Ordering::Relaxed);

        tracing::info!(
            server_time = response.server_time,
            offset_ms = offset,
            rtt_ms = rtt,
            "Time synchronized with Binance server"
        );
        Ok(())
    }

    // ========================================================================
    // Market Data
    // ========================================================================

    /// GET /api/v3/depth
    pub async fn get_depth_snapshot(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<DepthSnapshotResponse, BinanceRestError> {
        let query = format!("symbol={symbol}&limit={limit}");
        let response: DepthSnapshotResponse = self
            .http
            .request(Method::GET, "/api/v3/depth", Some(&query), None)
            .await?;

        tracing::debug!(
            symbol,
            last_update_id = response.last_update_id,
            bid_levels = response.bids.len(),
            ask_levels = response.asks.len(),
            "Depth snapshot received"
        );
        Ok(response)
    }

    // ========================================================================
    // Account
    // ========================================================================

    /// GET /api/v3/account
    pub async fn get_account(&self) -> Result<AccountResponse, BinanceRestError> {
        self.signed(Method::GET, "/api/v3/account", &[]).await
    }

    /// GET /api/v3/openOrders
    pub async fn get_open_orders(
        &self,
        symbol: &str,
    ) -> Result<Vec<OpenOrderResponse>, BinanceRestError> {
        self.signed(
            Method::GET,
            "/api/v3/openOrders",
            &[("symbol", symbol.to_string())],
        )
        .await
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Good-till-canceled limit order.
    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<NewOrderResponse, BinanceRestError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.as_binance_str().to_string()),
            ("type", OrderType::Limit.as_binance_str().to_string()),
            ("timeInForce", TimeInForce::GTC.as_binance_str().to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("price", price.normalize().to_string()),
            ("newOrderRespType", "ACK".to_string()),
        ];
        tracing::info!(symbol, side = ?side, %price, %quantity, "Placing limit order");
        self.place(&params).await
    }

    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<NewOrderResponse, BinanceRestError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.as_binance_str().to_string()),
            ("type", OrderType::Market.as_binance_str().to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newOrderRespType", "ACK".to_string()),
        ];
        tracing::info!(symbol, side = ?side, %quantity, "Placing market order");
        self.place(&params).await
    }

    async fn place(&self, params: &[(&str, String)]) -> Result<NewOrderResponse, BinanceRestError> {
        let response: NewOrderResponse = self.signed(Method::POST, "/api/v3/order", params).await?;
        tracing::info!(order_id = response.order_id, "Order placed");
        Ok(response)
    }

    /// DELETE /api/v3/order
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<CancelOrderResponse, BinanceRestError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let response: CancelOrderResponse =
            self.signed(Method::DELETE, "/api/v3/order", &params).await?;
        tracing::info!(order_id, status = %response.status, "Order cancel acknowledged");
        Ok(response)
    }

    // ========================================================================
    // Listen Key Management
    // ========================================================================

    /// Valid for 60 minutes unless kept alive.
    pub async fn create_listen_key(&self) -> Result<String, BinanceRestError> {
        let response: ListenKeyResponse = self
            .http
            .request(
                Method::POST,
                "/api/v3/userDataStream",
                None,
                Some(self.credentials.api_key()),
            )
            .await?;
        tracing::info!("Created listen key");
        Ok(response.listen_key)
    }

    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), BinanceRestError> {
        self.listen_key_call(Method::PUT, listen_key).await?;
        tracing::debug!("Listen key refreshed");
        Ok(())
    }

    pub async fn close_listen_key(&self, listen_key: &str) -> Result<(), BinanceRestError> {
        self.listen_key_call(Method::DELETE, listen_key).await?;
        tracing::info!("Listen key closed");
        Ok(())
    }

    async fn listen_key_call(&self, method: Method, listen_key: &str) -> Result<(), BinanceRestError> {
        let query = format!("listenKey={listen_key}");
        self.http
            .request_empty(
                method,
                "/api/v3/userDataStream",
                Some(&query),
                Some(self.credentials.api_key()),
            )
            .await?;
        Ok(())
    }

    async fn signed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, BinanceRestError> {
        let query = RequestSigner::new(&self.credentials)
            .with_recv_window(self.recv_window_ms)
            .sign_params(params, self.server_timestamp_ms())?;
        let response = self
            .http
            .request(method, path, Some(&query), Some(self.credentials.api_key()))
            .await?;
        Ok(response)
    }
}

impl std::fmt::Debug for BinanceRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceRestClient")
            .field("environment", &self.environment)
            .field("base_url", &self.http.base_url())
            .field("credentials", &self.credentials)
            .field(
                "time_offset_ms",
                &self.time_offset_ms.load(Ordering::Relaxed),
            )
            .finish()
    }
}
