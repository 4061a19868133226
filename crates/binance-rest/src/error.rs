use execution_core::GatewayError;
use serde::Deserialize;
use thiserror::Error;

use crate::http::HttpError;

#[derive(Debug, Error)]
pub enum BinanceRestError {
    /// Transport-level failure (network, timeout, rate limit).
    #[error("REST error: {0}")]
    Rest(HttpError),

    /// The venue answered with `{"code": .., "msg": ..}`.
    #[error("Binance API error {code}: {message}")]
    ApiError { code: i32, message: String },

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Order not found")]
    OrderNotFound,

    #[error("Listen key expired or invalid")]
    ListenKeyExpired,

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Signing error: {0}")]
    Signing(String),
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: i32,
    msg: String,
}

impl BinanceRestError {
    fn classify(code: i32, message: String) -> Self {
        match code {
            -1125 => Self::ListenKeyExpired,
            -2010 => Self::InsufficientBalance,
            -2011 | -2013 => Self::OrderNotFound,
            _ => Self::ApiError { code, message },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rest(e) => e.is_retryable(),
            // Unknown / disconnected / too many requests / server busy.
            Self::ApiError { code, .. } => matches!(code, -1000 | -1001 | -1003 | -1008 | -1015 | -1016),
            _ => false,
        }
    }
}

impl From<HttpError> for BinanceRestError {
    fn from(err: HttpError) -> Self {
        if let HttpError::Status { body, .. } = &err {
            if let Ok(api) = serde_json::from_str::<ApiErrorBody>(body) {
                return Self::classify(api.code, api.msg);
            }
        }
        Self::Rest(err)
    }
}

impl From<BinanceRestError> for GatewayError {
    fn from(err: BinanceRestError) -> Self {
        if err.is_retryable() {
            GatewayError::Transient(err.to_string())
        } else {
            GatewayError::Rejected(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16, body: &str) -> HttpError {
        HttpError::Status {
            status: code,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_api_error_body_is_classified() {
        let err = BinanceRestError::from(status(
            400,
            r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
        ));
        assert!(matches!(err, BinanceRestError::InsufficientBalance));

        let err = BinanceRestError::from(status(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#));
        assert!(matches!(err, BinanceRestError::ApiError { code: -1121, .. }));
    }

    #[test]
    fn test_unparseable_body_stays_transport_error() {
        let err = BinanceRestError::from(status(502, "<html>bad gateway</html>"));
        assert!(matches!(err, BinanceRestError::Rest(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_gateway_error_mapping() {
        let transient: GatewayError = BinanceRestError::Rest(HttpError::Timeout).into();
        assert!(transient.is_retryable());

        let rejected: GatewayError = BinanceRestError::OrderNotFound.into();
        assert!(matches!(rejected, GatewayError::Rejected(_)));
    }
}
