//! Yahoo Finance market data provider.
//!
//! Prices: `https://query1.finance.yahoo.com/v8/finance/chart/{symbol}`
//! (`meta.regularMarketPrice`). Headlines:
//! `https://query1.finance.yahoo.com/v1/finance/search?q={symbol}`
//! (`news[].title`). Neither endpoint needs auth, but both reject the
//! default client user agent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::*;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{MarketDataProvider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/120.0.0.0 Safari/537.36";

/// Decimal places kept on provider prices.
const PRICE_DP: u32 = 4;

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    result: Option<Vec<ChartData>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    regular_market_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    news: Vec<NewsItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    provider_publish_time: Option<i64>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct YahooProvider {
    http: Client,
    base_url: String,
}

impl YahooProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build Yahoo Finance HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        symbol: &str,
    ) -> Result<T, ProviderError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(status, symbol));
        }

        resp.json::<T>()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))
    }

    fn parse_price(body: ChartResponse, symbol: &str) -> Result<Decimal, ProviderError> {
        if let Some(err) = body.chart.error {
            return Err(ProviderError::Permanent(format!("Yahoo error for {symbol}: {err}")));
        }
        let raw = body
            .chart
            .result
            .and_then(|r| r.into_iter().next())
            .and_then(|d| d.meta.regular_market_price)
            .ok_or_else(|| ProviderError::Permanent(format!("No price for {symbol}")))?;
        to_price(raw)
            .ok_or_else(|| ProviderError::Permanent(format!("Invalid price {raw} for {symbol}")))
    }

    fn parse_headlines(body: SearchResponse, limit: usize) -> Vec<String> {
        let mut items: Vec<(i64, String)> = body
            .news
            .into_iter()
            .filter_map(|n| {
                let title = n.title?.trim().to_string();
                (!title.is_empty()).then(|| (n.provider_publish_time.unwrap_or(0), title))
            })
            .collect();
        // Newest first; stable so equal timestamps keep provider order.
        items.sort_by(|a, b| b.0.cmp(&a.0));
        items.into_iter().take(limit).map(|(_, t)| t).collect()
    }
}

/// Convert a provider float into a positive, rounded price.
fn to_price(raw: f64) -> Option<Decimal> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    Decimal::from_f64(raw).map(|d| d.round_dp(PRICE_DP))
}

#[async_trait]
impl MarketDataProvider for YahooProvider {
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ProviderError> {
        let url = format!(
            "{}/v8/finance/chart/{}?range=1d&interval=1d",
            self.base_url,
            urlencoding::encode(symbol)
        );
        debug!(symbol, "Fetching Yahoo chart");
        let body: ChartResponse = self.get_json(&url, symbol).await?;
        Self::parse_price(body, symbol)
    }

    async fn headlines(&self, symbol: &str, limit: usize) -> Result<Vec<String>, ProviderError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/v1/finance/search?q={}&quotesCount=0&newsCount={}",
            self.base_url,
            urlencoding::encode(symbol),
            limit.max(5)
        );
        debug!(symbol, "Fetching Yahoo news");
        let body: SearchResponse = self.get_json(&url, symbol).await?;
        Ok(Self::parse_headlines(body, limit))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
