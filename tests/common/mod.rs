//! Shared test helpers: a fixed-price market data provider, a scripted
//! language model, and coordinator wiring against a temp directory.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use swiss_trader::data::{MarketDataProvider, ProviderError};
use swiss_trader::engine::coordinator::{RunCoordinator, RunSettings};
use swiss_trader::engine::decision::DecisionEngine;
use swiss_trader::engine::fetcher::{FetchSettings, MarketDataFetcher};
use swiss_trader::llm::{Completion, LanguageModel};
use swiss_trader::retry::RetryPolicy;
use swiss_trader::risk::RiskLimits;
use swiss_trader::storage::LedgerStore;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Serves fixed prices. Symbols without a price fail transiently.
#[derive(Default)]
pub struct FakeProvider {
    prices: HashMap<String, Decimal>,
    headlines: HashMap<String, Vec<String>>,
    pub price_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(prices: &[(&str, Decimal)]) -> Self {
        Self {
            prices: prices.iter().map(|(s, p)| (s.to_string(), *p)).collect(),
            ..Default::default()
        }
    }

    pub fn with_headlines(mut self, symbol: &str, headlines: &[&str]) -> Self {
        self.headlines.insert(
            symbol.to_string(),
            headlines.iter().map(|h| h.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl MarketDataProvider for FakeProvider {
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ProviderError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ProviderError::Transient(format!("connection reset for {symbol}")))
    }

    async fn headlines(&self, symbol: &str, limit: usize) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .headlines
            .get(symbol)
            .map(|h| h.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// Replays canned replies in order. `None`, or running out of replies,
/// simulates an unreachable model.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Option<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Option<&str>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(|r| r.map(String::from)).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(reply: &str) -> Arc<Self> {
        Self::new(vec![Some(reply)])
    }

    pub fn unreachable() -> Arc<Self> {
        Self::new(vec![])
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, n: usize) -> String {
        self.prompts.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<Completion> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.replies.lock().unwrap().pop_front().flatten() {
            Some(text) => Ok(Completion {
                text,
                tokens_used: 0,
            }),
            None => anyhow::bail!("model unreachable"),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn ledger_path(dir: &Path) -> PathBuf {
    dir.join("portfolio.json")
}

pub fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub struct Setup {
    pub watchlist: Vec<String>,
    pub initial_cash: Decimal,
    pub limits: RiskLimits,
    pub dry_run: bool,
}

impl Setup {
    pub fn new(watchlist: &[&str], initial_cash: Decimal) -> Self {
        Self {
            watchlist: symbols(watchlist),
            initial_cash,
            limits: RiskLimits::default(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn limits(mut self, limits: RiskLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn coordinator(
        &self,
        dir: &Path,
        provider: Arc<FakeProvider>,
        model: Arc<ScriptedModel>,
    ) -> RunCoordinator {
        let fetch = FetchSettings {
            retry: RetryPolicy::immediate(2),
            max_headlines: 3,
            concurrency: 4,
        };
        RunCoordinator::new(
            MarketDataFetcher::new(provider, fetch),
            DecisionEngine::new(model),
            LedgerStore::new(ledger_path(dir)),
            RunSettings {
                watchlist: self.watchlist.clone(),
                initial_cash: self.initial_cash,
                limits: self.limits.clone(),
                dry_run: self.dry_run,
            },
        )
    }
}
