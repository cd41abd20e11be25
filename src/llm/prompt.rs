//! Prompt construction for the decision request.
//!
//! One consolidated prompt per run: the shared cash view, any guardrail
//! budget, forced exits already decided by the risk rules, and per symbol
//! the last price, whether it is held, and up to three headlines.

use rust_decimal::prelude::*;
use std::collections::HashMap;

use crate::risk::RiskLimits;
use crate::types::{Decision, Portfolio, WatchlistQuote};

const SYSTEM_PROMPT: &str = "\
You are a conservative swing trader managing a paper-trading stock portfolio. \
You hold positions for days to weeks, prefer capital preservation over chasing momentum, \
and only act when recent news gives a clear catalyst.

Respond with ONLY a JSON array and nothing else: no prose, no markdown, no code fences. \
Each element is an object with exactly these fields:
  \"symbol\":   one of the symbols listed in the request
  \"action\":   \"BUY\", \"SELL\" or \"HOLD\"
  \"quantity\": a non-negative whole number of shares (0 for HOLD)
  \"reason\":   one short sentence citing the headline or price behind the decision

Give at most one decision per symbol. Size BUYs so their combined cost stays within the \
available cash. SELL only shares you hold.";

/// Longest previous reply echoed back in a repair request.
const MAX_ECHOED_REPLY: usize = 2000;

pub fn system_prompt() -> &'static str {
    SYSTEM_PROMPT
}

/// Build the single decision request for this run.
pub fn build_decision_prompt(
    quotes: &[WatchlistQuote],
    portfolio: &Portfolio,
    forced_exits: &[Decision],
    limits: &RiskLimits,
) -> String {
    let prices: HashMap<String, Decimal> = quotes
        .iter()
        .map(|q| (q.symbol.clone(), q.last_price))
        .collect();
    let total_value = portfolio.total_value(&prices);

    let mut prompt = String::new();

    prompt.push_str("PORTFOLIO\n");
    prompt.push_str(&format!("Cash: ${:.2}\n", portfolio.cash));
    prompt.push_str(&format!("Total value: ${:.2}\n", total_value));
    if portfolio.holdings.is_empty() {
        prompt.push_str("Holdings: none\n");
    } else {
        prompt.push_str("Holdings:\n");
        for h in portfolio.holdings.values() {
            prompt.push_str(&format!(
                "  - {}: {} shares, average cost ${:.2}\n",
                h.symbol, h.shares, h.average_cost
            ));
        }
    }

    if let Some(budget) = buy_budget(portfolio, total_value, limits) {
        prompt.push_str(&format!("Max cost per BUY: ${:.2}\n", budget));
    }
    if let Some(max) = limits.max_positions {
        let open = portfolio.holdings.len();
        prompt.push_str(&format!(
            "Open positions: {open}/{max} (new symbols can only be bought while below {max})\n"
        ));
    }
    if let Some(min) = limits.min_trade_value {
        prompt.push_str(&format!("Minimum BUY cost: ${:.2}\n", min));
    }

    if !forced_exits.is_empty() {
        prompt.push_str("\nALREADY DECIDED BY RISK RULES (do not repeat these SELLs)\n");
        for d in forced_exits {
            prompt.push_str(&format!("  - SELL {} x{}: {}\n", d.symbol, d.quantity, d.reason));
        }
    }

    prompt.push_str("\nWATCHLIST\n");
    for q in quotes {
        let held = portfolio.shares_of(&q.symbol);
        prompt.push_str(&format!("\n{} | last price ${:.2}", q.symbol, q.last_price));
        if held > 0 {
            prompt.push_str(&format!(" | held: {held} shares"));
        } else {
            prompt.push_str(" | not held");
        }
        prompt.push('\n');
        if q.headlines.is_empty() {
            prompt.push_str("  (no recent headlines)\n");
        }
        for headline in &q.headlines {
            prompt.push_str(&format!("  * {headline}\n"));
        }
    }

    prompt.push_str(&format!(
        "\nReturn one decision per symbol above ({}) as a JSON array.\n",
        quotes
            .iter()
            .map(|q| q.symbol.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    ));

    prompt
}

/// Follow-up request after a reply could not be parsed.
pub fn build_repair_prompt(decision_prompt: &str, previous_reply: &str, error: &str) -> String {
    let echoed: String = previous_reply.chars().take(MAX_ECHOED_REPLY).collect();
    format!(
        "{decision_prompt}\n\
         Your previous reply could not be parsed ({error}):\n\
         ---\n{echoed}\n---\n\
         Reply again with ONLY the JSON array of objects with fields \
         \"symbol\", \"action\", \"quantity\", \"reason\". No other text."
    )
}

/// Per-trade spend the guardrails leave, when any spend guardrail is set.
fn buy_budget(portfolio: &Portfolio, total_value: Decimal, limits: &RiskLimits) -> Option<Decimal> {
    let reserve_cap = limits
        .min_cash_reserve_pct
        .map(|pct| (portfolio.cash - total_value * pct).max(Decimal::ZERO));
    let position_cap = limits.max_position_pct.map(|pct| total_value * pct);

    match (reserve_cap, position_cap) {
        (None, None) => None,
        (Some(a), None) | (None, Some(a)) => Some(a.min(portfolio.cash)),
        (Some(a), Some(b)) => Some(a.min(b).min(portfolio.cash)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Holding};
    use rust_decimal_macros::dec;

    fn quotes() -> Vec<WatchlistQuote> {
        vec![
            WatchlistQuote {
                symbol: "AAPL".into(),
                last_price: dec!(190.5),
                headlines: vec!["Apple unveils new chip".into(), "iPhone sales steady".into()],
            },
            WatchlistQuote {
                symbol: "ASML".into(),
                last_price: dec!(700),
                headlines: vec![],
            },
        ]
    }

    fn portfolio() -> Portfolio {
        let mut p = Portfolio::new(dec!(10000));
        p.cash = dec!(8000);
        p.holdings.insert(
            "ASML".into(),
            Holding {
                symbol: "ASML".into(),
                shares: 3,
                average_cost: dec!(650),
            },
        );
        p
    }

    #[test]
    fn test_system_prompt_states_contract() {
        let s = system_prompt();
        assert!(s.contains("conservative swing trader"));
        assert!(s.contains("JSON array"));
        for field in ["\"symbol\"", "\"action\"", "\"quantity\"", "\"reason\""] {
            assert!(s.contains(field), "missing {field}");
        }
    }

    #[test]
    fn test_decision_prompt_includes_cash_view_and_symbols() {
        let prompt = build_decision_prompt(&quotes(), &portfolio(), &[], &RiskLimits::default());
        assert!(prompt.contains("Cash: $8000.00"));
        // 8000 + 3 * 700
        assert!(prompt.contains("Total value: $10100.00"));
        assert!(prompt.contains("ASML: 3 shares, average cost $650.00"));
        assert!(prompt.contains("AAPL | last price $190.50 | not held"));
        assert!(prompt.contains("ASML | last price $700.00 | held: 3 shares"));
        assert!(prompt.contains("* Apple unveils new chip"));
        assert!(prompt.contains("(no recent headlines)"));
        assert!(!prompt.contains("Max cost per BUY"));
    }

    #[test]
    fn test_decision_prompt_includes_guardrails_and_forced_exits() {
        let limits = RiskLimits {
            max_position_pct: Some(dec!(0.10)),
            min_cash_reserve_pct: Some(dec!(0.15)),
            max_positions: Some(12),
            min_trade_value: Some(dec!(500)),
            ..Default::default()
        };
        let exits = vec![Decision::new("ASML", Action::Sell, 3, "STOP-LOSS: position -12%")];
        let prompt = build_decision_prompt(&quotes(), &portfolio(), &exits, &limits);
        // min(8000 - 1515, 1010)
        assert!(prompt.contains("Max cost per BUY: $1010.00"));
        assert!(prompt.contains("Open positions: 1/12"));
        assert!(prompt.contains("Minimum BUY cost: $500.00"));
        assert!(prompt.contains("SELL ASML x3: STOP-LOSS"));
    }

    #[test]
    fn test_repair_prompt_echoes_error_and_truncates() {
        let long_reply = "x".repeat(5000);
        let repair = build_repair_prompt("BASE", &long_reply, "no JSON found");
        assert!(repair.starts_with("BASE"));
        assert!(repair.contains("no JSON found"));
        assert!(repair.len() < 3000);
    }
}
