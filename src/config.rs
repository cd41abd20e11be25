//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The model API key is referenced by env-var name in the config and
//! resolved at startup into a `SecretString`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::retry::RetryPolicy;
use crate::risk::RiskLimits;
use crate::types::TraderError;

/// Headline cap per symbol.
pub const MAX_HEADLINES: usize = 3;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub watchlist: WatchlistConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub risk: RiskConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchlistConfig {
    pub symbols: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketDataConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_max_headlines")]
    pub max_headlines: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_market_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            max_headlines: default_max_headlines(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_backoff_ms(),
            request_timeout_secs: default_market_timeout(),
            concurrency: default_concurrency(),
        }
    }
}

impl MarketDataConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_llm_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Override for OpenAI-compatible gateways (e.g. OpenRouter).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_backoff_ms)
    }
}

/// Guardrails; every limit is optional and off unless set.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RiskConfig {
    pub max_position_pct: Option<Decimal>,
    pub min_cash_reserve_pct: Option<Decimal>,
    pub max_positions: Option<usize>,
    pub min_trade_value: Option<Decimal>,
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
}

impl RiskConfig {
    pub fn limits(&self) -> RiskLimits {
        RiskLimits {
            max_position_pct: self.max_position_pct,
            min_cash_reserve_pct: self.min_cash_reserve_pct,
            max_positions: self.max_positions,
            min_trade_value: self.min_trade_value,
            stop_loss_pct: self.stop_loss_pct,
            take_profit_pct: self.take_profit_pct,
        }
    }
}

fn default_agent_name() -> String {
    "SWISS-TRADER".to_string()
}
fn default_initial_cash() -> Decimal {
    dec!(50000)
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_ledger_path() -> String {
    "portfolio.json".to_string()
}
fn default_provider() -> String {
    "yahoo".to_string()
}
fn default_max_headlines() -> usize {
    MAX_HEADLINES
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_market_timeout() -> u64 {
    15
}
fn default_concurrency() -> usize {
    4
}
fn default_llm_provider() -> String {
    "gemini".to_string()
}
fn default_llm_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_llm_backoff_ms() -> u64 {
    1000
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse, normalise and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: AppConfig = toml::from_str(contents)?;
        config.normalise();
        config.validate()?;
        Ok(config)
    }

    /// Upper-case and de-duplicate symbols, cap headlines.
    fn normalise(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.watchlist.symbols = self
            .watchlist
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        self.market_data.max_headlines = self.market_data.max_headlines.min(MAX_HEADLINES);
    }

    pub fn validate(&self) -> Result<(), TraderError> {
        if self.watchlist.symbols.is_empty() {
            return Err(TraderError::Config("watchlist.symbols is empty".into()));
        }
        if self.agent.initial_cash <= Decimal::ZERO {
            return Err(TraderError::Config("agent.initial_cash must be positive".into()));
        }
        if self.market_data.max_attempts == 0 || self.llm.max_attempts == 0 {
            return Err(TraderError::Config("max_attempts must be at least 1".into()));
        }
        if self.market_data.concurrency == 0 {
            return Err(TraderError::Config("market_data.concurrency must be at least 1".into()));
        }
        if self.market_data.request_timeout_secs == 0 || self.llm.request_timeout_secs == 0 {
            return Err(TraderError::Config("request timeouts must be non-zero".into()));
        }

        let pcts = [
            ("risk.max_position_pct", self.risk.max_position_pct),
            ("risk.min_cash_reserve_pct", self.risk.min_cash_reserve_pct),
            ("risk.stop_loss_pct", self.risk.stop_loss_pct),
            ("risk.take_profit_pct", self.risk.take_profit_pct),
        ];
        for (name, value) in pcts {
            if let Some(v) = value {
                if v <= Decimal::ZERO || v > Decimal::ONE {
                    return Err(TraderError::Config(format!("{name} must be in (0, 1], got {v}")));
                }
            }
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String, TraderError> {
        std::env::var(env_name)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| TraderError::Config(format!("Environment variable not set: {env_name}")))
    }

    /// The model API key, wrapped so it cannot reach logs.
    pub fn llm_api_key(&self) -> Result<SecretString, TraderError> {
        Self::resolve_env(&self.llm.api_key_env).map(SecretString::new)
    }
}
