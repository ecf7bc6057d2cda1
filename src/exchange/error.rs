//! Exchange error taxonomy
//!
//! Transient network failures retry inside the adapter; rate limits carry
//! the retry-after; business errors carry the exchange code so callers can
//! branch on the ones that matter (-1021 timestamp, -2010 immediate match,
//! -2011 unknown order).

use thiserror::Error;

/// Binance error code for a timestamp outside the recv window.
pub const CODE_TIMESTAMP_OUT_OF_SYNC: i64 = -1021;
/// Binance error code for an invalid signature timestamp.
pub const CODE_INVALID_TIMESTAMP: i64 = -1022;
/// Order would immediately match (rejected post-only / price protection).
pub const CODE_IMMEDIATE_MATCH: i64 = -2010;
/// Cancel/query of an order the exchange no longer knows.
pub const CODE_UNKNOWN_ORDER: i64 = -2011;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Timeout or connection failure after retries exhausted.
    #[error("transport error: {0}")]
    Transport(String),

    /// 429 from the exchange, or the local tracker refusing to send.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Business error response with the exchange's code and message.
    #[error("exchange error [{code}]: {message}")]
    Api { code: i64, message: String },

    /// A response that does not decode into the expected shape.
    #[error("response decode error: {0}")]
    Decode(String),

    /// A request rejected locally before it was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ExchangeError {
    pub fn api_code(&self) -> Option<i64> {
        match self {
            ExchangeError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Unknown-order on a cancel usually means the order already
    /// filled/cancelled; callers treat it as success-equivalent.
    pub fn is_unknown_order(&self) -> bool {
        self.api_code() == Some(CODE_UNKNOWN_ORDER)
    }

    pub fn is_timestamp_error(&self) -> bool {
        matches!(
            self.api_code(),
            Some(CODE_TIMESTAMP_OUT_OF_SYNC) | Some(CODE_INVALID_TIMESTAMP)
        )
    }
}

/// Order placement/cancel failure carrying the exchange diagnostics.
#[derive(Debug, Error)]
#[error("order error [{code}]: {message}")]
pub struct OrderError {
    pub code: i64,
    pub message: String,
}

impl From<ExchangeError> for OrderError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Api { code, message } => OrderError { code, message },
            other => OrderError {
                code: -1,
                message: other.to_string(),
            },
        }
    }
}
