//! Portfolio ledger.
//!
//! Applies decisions to the loaded Portfolio in order, appends one
//! valuation point, then checks the invariants and persists. BUYs are
//! clamped to affordable whole shares (and to any guardrails), SELLs to
//! the shares held. Dropping the ledger without `commit` writes nothing.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::risk::{whole_shares, BuyVerdict, RiskLimits};
use crate::storage::LedgerStore;
use crate::types::{
    Action, Decision, Holding, Portfolio, TradeAction, TradeRecord, TraderError, ValuationPoint,
};

/// Decimal places kept on running average cost.
const AVG_COST_DP: u32 = 8;

/// Result of applying one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Traded. `trade.quantity < requested` means a partial fill.
    Filled { trade: TradeRecord, requested: u64 },
    Held { symbol: String, reason: String },
    Skipped {
        symbol: String,
        action: Action,
        requested: u64,
        reason: String,
    },
}

impl ExecutionOutcome {
    pub fn is_partial(&self) -> bool {
        matches!(self, ExecutionOutcome::Filled { trade, requested } if trade.quantity < *requested)
    }

    pub fn trade(&self) -> Option<&TradeRecord> {
        match self {
            ExecutionOutcome::Filled { trade, .. } => Some(trade),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Filled { trade, requested } => {
                write!(f, "{trade}")?;
                if trade.quantity < *requested {
                    write!(f, " PARTIAL (requested {requested})")?;
                }
                write!(f, " | {}", trade.reason)
            }
            ExecutionOutcome::Held { symbol, reason } => write!(f, "HOLD {symbol} | {reason}"),
            ExecutionOutcome::Skipped {
                symbol,
                action,
                requested,
                reason,
            } => write!(f, "SKIP {action} {symbol} x{requested} | {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Persisted,
    DryRun,
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitStatus::Persisted => write!(f, "persisted"),
            CommitStatus::DryRun => write!(f, "dry-run (not persisted)"),
        }
    }
}

pub struct PortfolioLedger {
    store: LedgerStore,
    portfolio: Portfolio,
    limits: RiskLimits,
    dry_run: bool,
    baseline_trades: usize,
    baseline_last_trade: Option<TradeRecord>,
    baseline_valuations: usize,
}

impl PortfolioLedger {
    /// Load the ledger, or start a fresh in-memory Portfolio with
    /// `initial_cash` when no document exists yet.
    pub fn open(
        store: LedgerStore,
        initial_cash: Decimal,
        limits: RiskLimits,
        dry_run: bool,
    ) -> Result<Self, TraderError> {
        let portfolio = match store.load()? {
            Some(p) => p,
            None => {
                info!(cash = %format!("${:.2}", initial_cash), "Fresh portfolio");
                Portfolio::new(initial_cash)
            }
        };

        Ok(Self {
            baseline_trades: portfolio.trade_history.len(),
            baseline_last_trade: portfolio.trade_history.last().cloned(),
            baseline_valuations: portfolio.valuation_history.len(),
            store,
            portfolio,
            limits,
            dry_run,
        })
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Apply `decisions` in order at the run's `prices`.
    pub fn apply(
        &mut self,
        decisions: &[Decision],
        prices: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> Vec<ExecutionOutcome> {
        decisions
            .iter()
            .map(|d| self.apply_decision(d, prices, now))
            .collect()
    }

    pub fn apply_decision(
        &mut self,
        decision: &Decision,
        prices: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let skip = |reason: String| ExecutionOutcome::Skipped {
            symbol: decision.symbol.clone(),
            action: decision.action,
            requested: decision.quantity,
            reason,
        };

        let result = match decision.action {
            Action::Hold => {
                return ExecutionOutcome::Held {
                    symbol: decision.symbol.clone(),
                    reason: decision.reason.clone(),
                }
            }
            Action::Buy => tradable_price(decision, prices)
                .and_then(|price| self.buy(decision, price, prices, now)),
            Action::Sell => {
                tradable_price(decision, prices).and_then(|price| self.sell(decision, price, now))
            }
        };
        result.unwrap_or_else(skip)
    }

    fn buy(
        &mut self,
        decision: &Decision,
        price: Decimal,
        prices: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, String> {
        let affordable = whole_shares(self.portfolio.cash, price);
        if affordable == 0 {
            return Err(format!(
                "insufficient cash (${:.2} < ${:.2})",
                self.portfolio.cash, price
            ));
        }
        let mut quantity = decision.quantity.min(affordable);

        if !self.limits.is_unrestricted() {
            let total_value = self.portfolio.total_value(prices);
            match self
                .limits
                .check_buy(&self.portfolio, &decision.symbol, quantity, price, total_value)
            {
                BuyVerdict::Allow {
                    quantity: allowed,
                    clamped_by,
                } => {
                    if !clamped_by.is_empty() {
                        debug!(
                            symbol = %decision.symbol,
                            from = quantity,
                            to = allowed,
                            rules = ?clamped_by,
                            "BUY clamped by guardrails"
                        );
                    }
                    quantity = allowed;
                }
                BuyVerdict::Block(reason) => return Err(reason),
            }
        }

        let cost = Decimal::from(quantity) * price;
        self.portfolio.cash -= cost;

        let holding = self
            .portfolio
            .holdings
            .entry(decision.symbol.clone())
            .or_insert_with(|| Holding {
                symbol: decision.symbol.clone(),
                shares: 0,
                average_cost: Decimal::ZERO,
            });
        let new_shares = holding.shares + quantity;
        holding.average_cost =
            ((holding.cost_basis() + cost) / Decimal::from(new_shares)).round_dp(AVG_COST_DP);
        holding.shares = new_shares;

        Ok(self.record_trade(decision, TradeAction::Buy, quantity, price, now))
    }

    fn sell(
        &mut self,
        decision: &Decision,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, String> {
        let Some(holding) = self.portfolio.holdings.get_mut(&decision.symbol) else {
            return Err("no position to sell".to_string());
        };

        let quantity = decision.quantity.min(holding.shares);
        holding.shares -= quantity;
        if holding.shares == 0 {
            self.portfolio.holdings.remove(&decision.symbol);
        }
        self.portfolio.cash += Decimal::from(quantity) * price;

        Ok(self.record_trade(decision, TradeAction::Sell, quantity, price, now))
    }

    fn record_trade(
        &mut self,
        decision: &Decision,
        action: TradeAction,
        quantity: u64,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let timestamp = match self.portfolio.trade_history.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let trade = TradeRecord {
            timestamp,
            symbol: decision.symbol.clone(),
            action,
            quantity,
            price,
            reason: decision.reason.clone(),
        };
        self.portfolio.trade_history.push(trade.clone());
        ExecutionOutcome::Filled {
            trade,
            requested: decision.quantity,
        }
    }

    /// Append the run's valuation point. Holdings without a quote are
    /// marked at their average cost.
    pub fn record_valuation(
        &mut self,
        prices: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> ValuationPoint {
        for symbol in self.portfolio.holdings.keys() {
            if !prices.contains_key(symbol) {
                warn!(symbol = %symbol, "No price this run, marking at average cost");
            }
        }
        let timestamp = match self.portfolio.valuation_history.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let point = self.portfolio.valuation_at(prices, timestamp);
        self.portfolio.valuation_history.push(point.clone());
        point
    }

    pub fn set_market_mood(&mut self, mood: Option<String>) {
        if mood.is_some() {
            self.portfolio.market_mood = mood;
        }
    }

    /// Check invariants and persist. Nothing is written in dry-run mode.
    pub fn commit(self) -> Result<CommitStatus, TraderError> {
        self.verify()?;

        if self.dry_run {
            info!(path = %self.store.path().display(), "Dry run, ledger not written");
            return Ok(CommitStatus::DryRun);
        }

        self.store.save(&self.portfolio)?;
        info!(path = %self.store.path().display(), "Ledger persisted");
        Ok(CommitStatus::Persisted)
    }

    fn verify(&self) -> Result<(), TraderError> {
        let p = &self.portfolio;
        p.check_invariants()?;

        if p.trade_history.len() < self.baseline_trades {
            return Err(TraderError::InvariantViolation(format!(
                "trade history shrank from {} to {}",
                self.baseline_trades,
                p.trade_history.len()
            )));
        }
        if let Some(last) = &self.baseline_last_trade {
            if p.trade_history.get(self.baseline_trades - 1) != Some(last) {
                return Err(TraderError::InvariantViolation(
                    "existing trade history was rewritten".to_string(),
                ));
            }
        }

        if p.valuation_history.len() != self.baseline_valuations + 1 {
            return Err(TraderError::InvariantViolation(format!(
                "expected exactly one new valuation point, found {}",
                p.valuation_history.len() as i64 - self.baseline_valuations as i64
            )));
        }

        // The newest point must reproduce from live holdings and its marks.
        if let Some(point) = p.valuation_history.last() {
            if point.cash != p.cash {
                return Err(TraderError::InvariantViolation(format!(
                    "valuation cash {} != ledger cash {}",
                    point.cash, p.cash
                )));
            }
            let mut recomputed = Decimal::ZERO;
            for h in p.holdings.values() {
                let Some(mark) = point.marks.get(&h.symbol) else {
                    return Err(TraderError::InvariantViolation(format!(
                        "valuation has no mark for {}",
                        h.symbol
                    )));
                };
                recomputed += Decimal::from(h.shares) * *mark;
            }
            if recomputed != point.holdings_value {
                return Err(TraderError::InvariantViolation(format!(
                    "holdings value {} does not reproduce ({recomputed})",
                    point.holdings_value
                )));
            }
        }
        Ok(())
    }
}

/// The run's price for a BUY/SELL, or why it can't trade.
fn tradable_price(
    decision: &Decision,
    prices: &HashMap<String, Decimal>,
) -> Result<Decimal, String> {
    let price = *prices
        .get(&decision.symbol)
        .ok_or_else(|| "no price this run".to_string())?;
    if price <= Decimal::ZERO {
        return Err(format!("invalid price {price}"));
    }
    if decision.quantity == 0 {
        return Err("zero quantity".to_string());
    }
    Ok(price)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
