//! Shared types for the Swiss Trader agent.
//!
//! The per-run market data, the model's decisions, and the persisted
//! `Portfolio` aggregate with its ledger invariants. Every other module
//! depends on these; they depend on nothing but serde, chrono and
//! rust_decimal.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Last price and recent headlines for one watchlist symbol.
/// Produced fresh each run and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchlistQuote {
    pub symbol: String,
    pub last_price: Decimal,
    /// Most recent first, at most three.
    pub headlines: Vec<String>,
}

impl fmt::Display for WatchlistQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ ${:.2} ({} headlines)",
            self.symbol,
            self.last_price,
            self.headlines.len()
        )
    }
}

/// A symbol whose quote could not be obtained this run.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub symbol: String,
    pub attempts: u32,
    pub reason: String,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {}",
            self.symbol, self.attempts, self.reason
        )
    }
}

/// Result of fetching the whole watchlist: successful quotes and
/// per-symbol failures, both in watchlist order.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub quotes: Vec<WatchlistQuote>,
    pub failures: Vec<FetchFailure>,
}

impl MarketSnapshot {
    /// Last price per quoted symbol.
    pub fn prices(&self) -> HashMap<String, Decimal> {
        self.quotes
            .iter()
            .map(|q| (q.symbol.clone(), q.last_price))
            .collect()
    }

    pub fn symbols_requested(&self) -> usize {
        self.quotes.len() + self.failures.len()
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Model recommendation for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

/// Case-insensitive, surrounding whitespace ignored.
impl std::str::FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            "HOLD" => Ok(Action::Hold),
            _ => Err(anyhow::anyhow!("Unknown action: {s}")),
        }
    }
}

/// A validated decision, consumed once by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: Action,
    pub quantity: u64,
    pub reason: String,
}

impl Decision {
    pub fn new(symbol: &str, action: Action, quantity: u64, reason: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            action,
            quantity,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} x{} | {}",
            self.action, self.symbol, self.quantity, self.reason
        )
    }
}

/// Direction of an executed trade. HOLD never produces a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// An open position. Absent from the map means zero shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub shares: u64,
    pub average_cost: Decimal,
}

impl Holding {
    pub fn cost_basis(&self) -> Decimal {
        Decimal::from(self.shares) * self.average_cost
    }
}

/// One executed trade. Append-only once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: u64,
    pub price: Decimal,
    pub reason: String,
}

impl TradeRecord {
    /// Cash moved by this trade.
    pub fn notional(&self) -> Decimal {
        Decimal::from(self.quantity) * self.price
    }
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ ${:.2} (${:.2})",
            self.action,
            self.quantity,
            self.symbol,
            self.price,
            self.notional()
        )
    }
}

/// Snapshot of portfolio worth, appended once per successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationPoint {
    pub timestamp: DateTime<Utc>,
    pub cash: Decimal,
    pub holdings_value: Decimal,
    pub total_value: Decimal,
    /// Price applied to each holding at this instant.
    #[serde(default)]
    pub marks: BTreeMap<String, Decimal>,
}

impl fmt::Display for ValuationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cash=${:.2} holdings=${:.2} total=${:.2}",
            self.cash, self.holdings_value, self.total_value
        )
    }
}

// ---------------------------------------------------------------------------
// Portfolio aggregate
// ---------------------------------------------------------------------------

/// The persisted ledger document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub initial_cash: Decimal,
    pub cash: Decimal,
    pub holdings: BTreeMap<String, Holding>,
    pub trade_history: Vec<TradeRecord>,
    pub valuation_history: Vec<ValuationPoint>,
    /// One-line market sentiment from the most recent model response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_mood: Option<String>,
}

impl fmt::Display for Portfolio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cash=${:.2} | positions={} | trades={} | valuations={}",
            self.cash,
            self.holdings.len(),
            self.trade_history.len(),
            self.valuation_history.len(),
        )
    }
}

impl Portfolio {
    /// Fresh portfolio holding only the initial cash endowment.
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            holdings: BTreeMap::new(),
            trade_history: Vec::new(),
            valuation_history: Vec::new(),
            market_mood: None,
        }
    }

    pub fn shares_of(&self, symbol: &str) -> u64 {
        self.holdings.get(symbol).map(|h| h.shares).unwrap_or(0)
    }

    /// Price used to mark each holding: the given price, or the holding's
    /// average cost when no price is available.
    pub fn marks(&self, prices: &HashMap<String, Decimal>) -> BTreeMap<String, Decimal> {
        self.holdings
            .values()
            .map(|h| {
                let mark = prices.get(&h.symbol).copied().unwrap_or(h.average_cost);
                (h.symbol.clone(), mark)
            })
            .collect()
    }

    /// `Σ shares × mark` over every holding.
    pub fn holdings_value(&self, marks: &BTreeMap<String, Decimal>) -> Decimal {
        self.holdings
            .values()
            .map(|h| {
                let mark = marks.get(&h.symbol).copied().unwrap_or(h.average_cost);
                Decimal::from(h.shares) * mark
            })
            .sum()
    }

    /// Cash plus holdings marked at `prices` (average cost where missing).
    pub fn total_value(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.cash + self.holdings_value(&self.marks(prices))
    }

    /// Build (without appending) a valuation point for the current state.
    pub fn valuation_at(
        &self,
        prices: &HashMap<String, Decimal>,
        timestamp: DateTime<Utc>,
    ) -> ValuationPoint {
        let marks = self.marks(prices);
        let holdings_value = self.holdings_value(&marks);
        ValuationPoint {
            timestamp,
            cash: self.cash,
            holdings_value,
            total_value: self.cash + holdings_value,
            marks,
        }
    }

    /// Structural invariants that must hold for any persisted document.
    pub fn check_invariants(&self) -> Result<(), TraderError> {
        if self.cash < Decimal::ZERO {
            return Err(TraderError::InvariantViolation(format!(
                "cash is negative: {}",
                self.cash
            )));
        }

        for (key, holding) in &self.holdings {
            if key != &holding.symbol {
                return Err(TraderError::InvariantViolation(format!(
                    "holding keyed {key} carries symbol {}",
                    holding.symbol
                )));
            }
            if holding.shares == 0 {
                return Err(TraderError::InvariantViolation(format!(
                    "zero-share holding left in map: {key}"
                )));
            }
            if holding.average_cost < Decimal::ZERO {
                return Err(TraderError::InvariantViolation(format!(
                    "negative average cost for {key}"
                )));
            }
        }

        if let Some(pair) = self
            .trade_history
            .windows(2)
            .find(|w| w[1].timestamp < w[0].timestamp)
        {
            return Err(TraderError::InvariantViolation(format!(
                "trade history out of order at {} ({} < {})",
                pair[1].symbol, pair[1].timestamp, pair[0].timestamp
            )));
        }

        if self
            .valuation_history
            .windows(2)
            .any(|w| w[1].timestamp < w[0].timestamp)
        {
            return Err(TraderError::InvariantViolation(
                "valuation history out of order".to_string(),
            ));
        }

        // Shares at past instants are not stored, so only the sum is checked
        // here; the newest point is re-derived against live holdings on commit.
        for point in &self.valuation_history {
            if point.cash + point.holdings_value != point.total_value {
                return Err(TraderError::InvariantViolation(format!(
                    "valuation at {} does not add up: {} + {} != {}",
                    point.timestamp, point.cash, point.holdings_value, point.total_value
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failure conditions a caller must be able to tell apart.
#[derive(Debug, thiserror::Error)]
pub enum TraderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Market data unavailable: all {count} symbol(s) failed to fetch")]
    AllFetchesFailed { count: usize },

    #[error("Model error ({model}): {message}")]
    Model { model: String, message: String },

    #[error("Corrupt ledger at {path}: {message}")]
    CorruptLedger { path: String, message: String },

    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Failed to persist ledger to {path}: {message}")]
    Persist { path: String, message: String },
}

impl TraderError {
    /// Process exit status reported to the scheduler.
    pub fn exit_code(&self) -> u8 {
        match self {
            TraderError::Config(_) => 2,
            TraderError::CorruptLedger { .. } => 3,
            TraderError::InvariantViolation(_) | TraderError::Persist { .. } => 4,
            TraderError::AllFetchesFailed { .. } | TraderError::Model { .. } => 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
