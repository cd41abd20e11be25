//! Hard risk rules the model cannot override.
//!
//! Two kinds: guardrails that clamp a BUY before the ledger executes it,
//! and forced exits (stop-loss / take-profit) decided from the loaded
//! portfolio before the model is consulted. Every limit is optional;
//! `RiskLimits::default()` imposes nothing beyond the ledger's own
//! affordability and oversell clamps.

use rust_decimal::prelude::*;
use std::collections::HashMap;
use tracing::info;

use crate::types::{Action, Decision, Portfolio};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskLimits {
    /// Max fraction of total value in one symbol.
    pub max_position_pct: Option<Decimal>,
    /// Fraction of total value that must stay in cash after a BUY.
    pub min_cash_reserve_pct: Option<Decimal>,
    /// Max number of distinct open positions.
    pub max_positions: Option<usize>,
    /// BUYs whose (clamped) cost falls below this are skipped.
    pub min_trade_value: Option<Decimal>,
    /// Sell the whole position at this loss from average cost.
    pub stop_loss_pct: Option<Decimal>,
    /// Sell half the position at this gain from average cost.
    pub take_profit_pct: Option<Decimal>,
}

/// Why a guardrail reduced or blocked a BUY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuyVerdict {
    /// Allowed at this quantity (possibly reduced), with the rules that bit.
    Allow { quantity: u64, clamped_by: Vec<&'static str> },
    Block(String),
}

impl RiskLimits {
    pub fn is_unrestricted(&self) -> bool {
        *self == RiskLimits::default()
    }

    /// Apply the BUY guardrails. `quantity` has already been clamped to
    /// what cash can pay for; `total_value` is the portfolio value at the
    /// run's prices.
    pub fn check_buy(
        &self,
        portfolio: &Portfolio,
        symbol: &str,
        quantity: u64,
        price: Decimal,
        total_value: Decimal,
    ) -> BuyVerdict {
        let mut qty = quantity;
        let mut clamped_by = Vec::new();

        if let Some(reserve_pct) = self.min_cash_reserve_pct {
            let spendable = (portfolio.cash - total_value * reserve_pct).max(Decimal::ZERO);
            let cap = whole_shares(spendable, price);
            if cap < qty {
                qty = cap;
                clamped_by.push("cash reserve");
            }
        }

        if let Some(position_pct) = self.max_position_pct {
            let existing = Decimal::from(portfolio.shares_of(symbol)) * price;
            let room = (total_value * position_pct - existing).max(Decimal::ZERO);
            let cap = whole_shares(room, price);
            if cap < qty {
                qty = cap;
                clamped_by.push("position limit");
            }
        }

        if qty == 0 {
            let rule = clamped_by.last().copied().unwrap_or("guardrail");
            return BuyVerdict::Block(format!("{rule} leaves no room"));
        }

        if let Some(min_value) = self.min_trade_value {
            let cost = Decimal::from(qty) * price;
            if cost < min_value {
                return BuyVerdict::Block(format!(
                    "trade too small (${cost:.2} < ${min_value:.2})"
                ));
            }
        }

        if let Some(max_positions) = self.max_positions {
            if !portfolio.holdings.contains_key(symbol)
                && portfolio.holdings.len() >= max_positions
            {
                return BuyVerdict::Block(format!("already at max {max_positions} positions"));
            }
        }

        BuyVerdict::Allow { quantity: qty, clamped_by }
    }

    /// Stop-loss and take-profit sells for the current holdings, in
    /// symbol order. Holdings without a price this run are left alone.
    pub fn forced_exits(
        &self,
        portfolio: &Portfolio,
        prices: &HashMap<String, Decimal>,
    ) -> Vec<Decision> {
        if self.stop_loss_pct.is_none() && self.take_profit_pct.is_none() {
            return Vec::new();
        }

        let mut exits = Vec::new();
        for holding in portfolio.holdings.values() {
            let Some(&price) = prices.get(&holding.symbol) else {
                continue;
            };
            if holding.average_cost.is_zero() {
                continue;
            }
            let pnl = (price - holding.average_cost) / holding.average_cost;
            let pnl_pct = (pnl * Decimal::ONE_HUNDRED).round_dp(1);

            if let Some(stop) = self.stop_loss_pct {
                if pnl <= -stop {
                    info!(symbol = %holding.symbol, pnl_pct = %pnl_pct, "STOP-LOSS triggered");
                    exits.push(Decision::new(
                        &holding.symbol,
                        Action::Sell,
                        holding.shares,
                        &format!(
                            "STOP-LOSS: position {pnl_pct}% from avg cost ${:.2}",
                            holding.average_cost
                        ),
                    ));
                    continue;
                }
            }

            if let Some(take) = self.take_profit_pct {
                if pnl >= take {
                    let qty = (holding.shares / 2).max(1);
                    info!(
                        symbol = %holding.symbol,
                        pnl_pct = %pnl_pct,
                        qty,
                        "TAKE-PROFIT triggered"
                    );
                    exits.push(Decision::new(
                        &holding.symbol,
                        Action::Sell,
                        qty,
                        &format!(
                            "TAKE-PROFIT: position +{pnl_pct}%, selling {qty} of {} shares",
                            holding.shares
                        ),
                    ));
                }
            }
        }
        exits
    }
}

/// Whole shares of `price` that `budget` pays for.
pub fn whole_shares(budget: Decimal, price: Decimal) -> u64 {
    if price <= Decimal::ZERO || budget <= Decimal::ZERO {
        return 0;
    }
    (budget / price).floor().to_u64().unwrap_or(0)
}
