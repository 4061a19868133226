//! API credentials and HMAC-SHA256 request signing.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::BinanceRestError;

type HmacSha256 = Hmac<Sha256>;

/// How long a signed request stays valid after its timestamp.
pub const DEFAULT_RECV_WINDOW_MS: u64 = 5000;

/// API key and secret. The secret is never printed.
#[derive(Clone)]
pub struct ApiCredentials {
    api_key: String,
    secret_key: SecretString,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: SecretString::new(secret_key.into()),
        }
    }

    /// Reads `BINANCE_API_KEY` and `BINANCE_SECRET_KEY`, loading `.env` first.
    pub fn from_env() -> Result<Self, BinanceRestError> {
        dotenvy::dotenv().ok();

        let api_key = std::env::var("BINANCE_API_KEY")
            .map_err(|_| BinanceRestError::MissingEnvVar("BINANCE_API_KEY".into()))?;
        let secret_key = std::env::var("BINANCE_SECRET_KEY")
            .map_err(|_| BinanceRestError::MissingEnvVar("BINANCE_SECRET_KEY".into()))?;

        Ok(Self::new(api_key, secret_key))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Builds signed query strings for private endpoints.
pub struct RequestSigner<'a> {
    credentials: &'a ApiCredentials,
    recv_window_ms: u64,
}

impl<'a> RequestSigner<'a> {
    pub fn new(credentials: &'a ApiCredentials) -> Self {
        Self {
            credentials,
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
        }
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    /// Lowercase hex HMAC-SHA256 of `message`.
    pub fn sign(&self, message: &str) -> Result<String, BinanceRestError> {
        let mut mac =
            HmacSha256::new_from_slice(self.credentials.secret_key.expose_secret().as_bytes())
                .map_err(|e| BinanceRestError::Signing(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// `params` in the given order, then `recvWindow`, `timestamp` and the
    /// signature over everything before it.
    pub fn sign_params(
        &self,
        params: &[(&str, String)],
        timestamp_ms: i64,
    ) -> Result<String, BinanceRestError> {
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        query.push(format!("recvWindow={}", self.recv_window_ms));
        query.push(format!("timestamp={timestamp_ms}"));

        let query = query.join("&");
        let signature = self.sign(&query)?;
        Ok(format!("{query}&signature={signature}"))
    }
}
