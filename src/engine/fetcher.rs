//! Market data fetcher.
//!
//! Prices and headlines for every symbol, fetched concurrently with a
//! bounded number in flight. Each call retries transient failures with
//! exponential backoff; a symbol whose price can't be fetched is
//! reported as a `FetchFailure` and the rest of the run carries on.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{MarketDataConfig, MAX_HEADLINES};
use crate::data::{MarketDataProvider, ProviderError};
use crate::retry::RetryPolicy;
use crate::types::{FetchFailure, MarketSnapshot, TraderError, WatchlistQuote};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub retry: RetryPolicy,
    pub max_headlines: usize,
    pub concurrency: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_headlines: MAX_HEADLINES,
            concurrency: 4,
        }
    }
}

impl FetchSettings {
    pub fn from_config(cfg: &MarketDataConfig) -> Self {
        Self {
            retry: cfg.retry_policy(),
            max_headlines: cfg.max_headlines.min(MAX_HEADLINES),
            concurrency: cfg.concurrency.max(1),
        }
    }
}

pub struct MarketDataFetcher {
    provider: Arc<dyn MarketDataProvider>,
    settings: FetchSettings,
}

impl MarketDataFetcher {
    pub fn new(provider: Arc<dyn MarketDataProvider>, settings: FetchSettings) -> Self {
        Self { provider, settings }
    }

    /// Fetch every symbol. Quotes and failures come back in input order.
    pub async fn fetch(&self, symbols: &[String]) -> Result<MarketSnapshot, TraderError> {
        info!(symbols = symbols.len(), "Fetching market data");

        let results: Vec<Result<WatchlistQuote, FetchFailure>> = stream::iter(symbols)
            .map(|symbol| self.fetch_symbol(symbol))
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut snapshot = MarketSnapshot::default();
        for result in results {
            match result {
                Ok(quote) => {
                    debug!(quote = %quote, "Quote fetched");
                    snapshot.quotes.push(quote);
                }
                Err(failure) => {
                    warn!(
                        symbol = %failure.symbol,
                        attempts = failure.attempts,
                        reason = %failure.reason,
                        "FETCH FAILED"
                    );
                    snapshot.failures.push(failure);
                }
            }
        }

        if !symbols.is_empty() && snapshot.quotes.is_empty() {
            return Err(TraderError::AllFetchesFailed {
                count: symbols.len(),
            });
        }

        info!(
            fetched = snapshot.quotes.len(),
            failed = snapshot.failures.len(),
            "Market data fetched"
        );
        Ok(snapshot)
    }

    async fn fetch_symbol(&self, symbol: &str) -> Result<WatchlistQuote, FetchFailure> {
        let retry = &self.settings.retry;

        let (price, attempts) = with_retry(retry, || self.provider.last_price(symbol)).await;
        let last_price = price.map_err(|e| FetchFailure {
            symbol: symbol.to_string(),
            attempts,
            reason: e.to_string(),
        })?;

        let limit = self.settings.max_headlines;
        let headlines = if limit == 0 {
            Vec::new()
        } else {
            let (result, attempts) =
                with_retry(retry, || self.provider.headlines(symbol, limit)).await;
            match result {
                Ok(raw) => clean_headlines(raw, limit),
                Err(e) => {
                    warn!(
                        symbol,
                        attempts,
                        error = %e,
                        "Headlines unavailable, continuing without"
                    );
                    Vec::new()
                }
            }
        };

        Ok(WatchlistQuote {
            symbol: symbol.to_string(),
            last_price,
            headlines,
        })
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
/// Returns the final result and how many attempts were made.
async fn with_retry<T, F, Fut>(retry: &RetryPolicy, mut op: F) -> (Result<T, ProviderError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        retry.wait(attempt).await;
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                debug!(attempt, error = %e, "Transient provider error, retrying");
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

fn clean_headlines(raw: Vec<String>, limit: usize) -> Vec<String> {
    raw.into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .take(limit)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    mock! {
        pub Provider {}

        #[async_trait]
        impl MarketDataProvider for Provider {
            async fn last_price(&self, symbol: &str) -> Result<Decimal, ProviderError>;
            async fn headlines(&self, symbol: &str, limit: usize) -> Result<Vec<String>, ProviderError>;
        }
    }

    fn settings(max_attempts: u32) -> FetchSettings {
        FetchSettings {
            retry: RetryPolicy::immediate(max_attempts),
            max_headlines: 3,
            concurrency: 4,
        }
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn fetcher(mock: MockProvider, max_attempts: u32) -> MarketDataFetcher {
        MarketDataFetcher::new(Arc::new(mock), settings(max_attempts))
    }

    #[tokio::test]
    async fn test_fetch_all_ok_in_order() {
        let mut mock = MockProvider::new();
        mock.expect_last_price().returning(|symbol| match symbol {
            "AAPL" => Ok(dec!(190)),
            _ => Ok(dec!(700)),
        });
        mock.expect_headlines()
            .returning(|symbol, _| Ok(vec![format!("{symbol} news")]));

        let snap = assert_ok!(fetcher(mock, 3).fetch(&symbols(&["AAPL", "ASML"])).await);
        assert_eq!(snap.quotes.len(), 2);
        assert_eq!(snap.quotes[0].symbol, "AAPL");
        assert_eq!(snap.quotes[0].last_price, dec!(190));
        assert_eq!(snap.quotes[1].headlines, vec!["ASML news"]);
        assert!(snap.failures.is_empty());
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut mock = MockProvider::new();
        mock.expect_last_price().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::Transient("timeout".into()))
            } else {
                Ok(dec!(42))
            }
        });
        mock.expect_headlines().returning(|_, _| Ok(vec![]));

        let snap = assert_ok!(fetcher(mock, 3).fetch(&symbols(&["AAPL"])).await);
        assert_eq!(snap.quotes[0].last_price, dec!(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let mut mock = MockProvider::new();
        mock.expect_last_price()
            .times(3)
            .returning(|_| Err(ProviderError::Transient("connection reset".into())));
        mock.expect_headlines().never();

        let err = assert_err!(fetcher(mock, 3).fetch(&symbols(&["AAPL"])).await);
        assert!(matches!(err, TraderError::AllFetchesFailed { count: 1 }));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let mut mock = MockProvider::new();
        mock.expect_last_price().returning(|symbol| match symbol {
            "ZZZZ" => Err(ProviderError::Permanent("No price for ZZZZ".into())),
            _ => Ok(dec!(10)),
        });
        mock.expect_headlines().returning(|_, _| Ok(vec![]));

        let snap = assert_ok!(fetcher(mock, 5).fetch(&symbols(&["AAPL", "ZZZZ"])).await);
        assert_eq!(snap.failures.len(), 1);
        assert_eq!(snap.failures[0].symbol, "ZZZZ");
        assert_eq!(snap.failures[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_two_of_ten_failing_still_quotes_eight() {
        let list = [
            "AAPL", "MSFT", "NVDA", "ASML", "SAP", "NESN", "BAD1", "TSLA", "BAD2", "AMZN",
        ];
        let mut mock = MockProvider::new();
        mock.expect_last_price().returning(|symbol| {
            if symbol.starts_with("BAD") {
                Err(ProviderError::Transient("503".into()))
            } else {
                Ok(dec!(100))
            }
        });
        mock.expect_headlines().returning(|_, _| Ok(vec![]));

        let snap = assert_ok!(fetcher(mock, 2).fetch(&symbols(&list)).await);
        assert_eq!(snap.quotes.len(), 8);
        let failed: Vec<&str> = snap.failures.iter().map(|f| f.symbol.as_str()).collect();
        assert_eq!(failed, vec!["BAD1", "BAD2"]);
        assert!(snap.failures.iter().all(|f| f.attempts == 2));
        assert_eq!(snap.symbols_requested(), 10);
    }

    #[tokio::test]
    async fn test_headline_failure_degrades_to_empty() {
        let mut mock = MockProvider::new();
        mock.expect_last_price().returning(|_| Ok(dec!(5)));
        mock.expect_headlines()
            .times(2)
            .returning(|_, _| Err(ProviderError::Transient("rate limited".into())));

        let snap = assert_ok!(fetcher(mock, 2).fetch(&symbols(&["F"])).await);
        assert_eq!(snap.quotes.len(), 1);
        assert!(snap.quotes[0].headlines.is_empty());
    }

    #[tokio::test]
    async fn test_headlines_cleaned_and_capped() {
        let mut mock = MockProvider::new();
        mock.expect_last_price().returning(|_| Ok(dec!(5)));
        mock.expect_headlines().returning(|_, limit| {
            assert_eq!(limit, 3);
            Ok(vec![
                "  first ".into(),
                "".into(),
                "second".into(),
                "third".into(),
                "fourth".into(),
            ])
        });

        let snap = assert_ok!(fetcher(mock, 1).fetch(&symbols(&["F"])).await);
        assert_eq!(snap.quotes[0].headlines, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_empty_symbol_list() {
        let mock = MockProvider::new();
        let snap = assert_ok!(fetcher(mock, 1).fetch(&[]).await);
        assert!(snap.quotes.is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let cfg = MarketDataConfig {
            max_headlines: 10,
            concurrency: 0,
            ..Default::default()
        };
        let s = FetchSettings::from_config(&cfg);
        assert_eq!(s.max_headlines, 3);
        assert_eq!(s.concurrency, 1);
        assert_eq!(s.retry.max_attempts, 3);
    }
}
