//! Binance spot REST API client.
//!
//! - **Signing**: HMAC-SHA256 over the query string with `recvWindow`
//! - **Time synchronization**: corrects for local clock skew
//! - **Market data**: depth snapshots for book synchronization
//! - **Account / orders**: balances, open orders, place and cancel
//! - **Listen keys**: create, keep alive and close user data streams
//!
//! [`BinanceRestClient`] implements [`execution_core::VenueGateway`].
//!
//! # Example
//!
//! ```rust,ignore
//! use binance_rest::{ApiCredentials, BinanceRestClient};
//!
//! let credentials = ApiCredentials::from_env()?;
//! let client = BinanceRestClient::with_environment(credentials, BinanceEnvironment::Testnet)?;
//! client.sync_time().await?;
//!
//! let snapshot = client.get_depth_snapshot("BTCUSDT", 1000).await?.into_snapshot();
//! ```

mod client;
mod error;
mod gateway;
mod http;
mod responses;
pub mod signing;

pub use client::BinanceRestClient;
pub use error::BinanceRestError;
pub use http::HttpError;
pub use responses::{
    AccountResponse, AssetBalance, CancelOrderResponse, DepthSnapshotResponse, ListenKeyResponse,
    NewOrderResponse, OpenOrderResponse, ServerTimeResponse,
};
pub use signing::{ApiCredentials, RequestSigner};
