//! Market data providers.
//!
//! Defines the `MarketDataProvider` trait the fetcher retries against,
//! and the Yahoo Finance implementation.

pub mod yahoo;

use async_trait::async_trait;
use rust_decimal::Decimal;

/// Provider failure, classified for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Network error, timeout, rate limit or server error. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// Unknown symbol, missing field, undecodable body. Retrying won't help.
    #[error("{0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Classify a reqwest transport error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ProviderError::Transient(err.to_string())
        } else if err.is_decode() {
            ProviderError::Permanent(format!("undecodable response: {err}"))
        } else {
            ProviderError::Transient(err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let msg = format!("HTTP {status} for {context}");
        if status.as_u16() == 429 || status.is_server_error() {
            ProviderError::Transient(msg)
        } else {
            ProviderError::Permanent(msg)
        }
    }
}

/// Source of last prices and headlines for ticker symbols.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Last traded price for `symbol`.
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ProviderError>;

    /// Up to `limit` recent headlines about `symbol`, newest first.
    async fn headlines(&self, symbol: &str, limit: usize) -> Result<Vec<String>, ProviderError>;
}
