//! Run coordinator.
//!
//! One invocation: open ledger → fetch → risk exits → decide → apply →
//! value → commit. Any abort before `commit` leaves the persisted ledger
//! untouched.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use super::decision::{DecisionEngine, DecisionSet};
use super::fetcher::MarketDataFetcher;
use super::ledger::{CommitStatus, ExecutionOutcome, PortfolioLedger};
use crate::risk::RiskLimits;
use crate::storage::LedgerStore;
use crate::types::{Action, Decision, MarketSnapshot, TraderError, ValuationPoint};

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub watchlist: Vec<String>,
    pub initial_cash: Decimal,
    pub limits: RiskLimits,
    pub dry_run: bool,
}

/// Everything one run did, for logging and tests.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub snapshot: MarketSnapshot,
    pub forced_exits: Vec<Decision>,
    pub decisions: DecisionSet,
    pub outcomes: Vec<ExecutionOutcome>,
    pub valuation: ValuationPoint,
    pub commit: CommitStatus,
}

impl RunReport {
    pub fn trades_executed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.trade().is_some()).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RUN SUMMARY run={} dry_run={} fetched={} failed={} decisions={} parse={} \
             trades={} cash=${:.2} holdings=${:.2} total=${:.2} ledger={}",
            self.run_id,
            self.dry_run,
            self.snapshot.quotes.len(),
            self.snapshot.failures.len(),
            self.decisions.decisions.len() + self.forced_exits.len(),
            self.decisions.parse,
            self.trades_executed(),
            self.valuation.cash,
            self.valuation.holdings_value,
            self.valuation.total_value,
            self.commit,
        )
    }
}

pub struct RunCoordinator {
    fetcher: MarketDataFetcher,
    engine: DecisionEngine,
    store: LedgerStore,
    settings: RunSettings,
}

impl RunCoordinator {
    pub fn new(
        fetcher: MarketDataFetcher,
        engine: DecisionEngine,
        store: LedgerStore,
        settings: RunSettings,
    ) -> Self {
        Self {
            fetcher,
            engine,
            store,
            settings,
        }
    }

    pub async fn run(&self) -> Result<RunReport, TraderError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, dry_run = self.settings.dry_run);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunReport, TraderError> {
        let s = &self.settings;
        info!(
            watchlist = s.watchlist.len(),
            ledger = %self.store.path().display(),
            "Run starting"
        );

        let mut ledger = PortfolioLedger::open(
            self.store.clone(),
            s.initial_cash,
            s.limits.clone(),
            s.dry_run,
        )?;

        let symbols = fetch_set(&s.watchlist, ledger.portfolio().holdings.keys());
        let snapshot = self.fetcher.fetch(&symbols).await?;
        let prices = snapshot.prices();

        let forced_exits = s.limits.forced_exits(ledger.portfolio(), &prices);
        let decisions = self
            .engine
            .decide(&snapshot.quotes, ledger.portfolio(), &forced_exits, &s.limits)
            .await?;

        let forced: HashSet<&str> = forced_exits.iter().map(|d| d.symbol.as_str()).collect();
        let model_decisions: Vec<Decision> = decisions
            .decisions
            .iter()
            .filter(|d| {
                let superseded = d.action != Action::Buy && forced.contains(d.symbol.as_str());
                if superseded {
                    info!(decision = %d, "Superseded by risk rule");
                }
                !superseded
            })
            .cloned()
            .collect();

        let now = Utc::now();
        let mut outcomes = ledger.apply(&forced_exits, &prices, now);
        outcomes.extend(ledger.apply(&model_decisions, &prices, now));
        for outcome in &outcomes {
            info!("{outcome}");
        }

        let valuation = ledger.record_valuation(&prices, now);
        ledger.set_market_mood(decisions.market_mood.clone());
        let commit = ledger.commit()?;

        let report = RunReport {
            run_id,
            dry_run: s.dry_run,
            snapshot,
            forced_exits,
            decisions,
            outcomes,
            valuation,
            commit,
        };
        info!("{report}");
        Ok(report)
    }
}

/// Watchlist order, then any held symbols not already on it.
fn fetch_set<'a>(watchlist: &[String], held: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut symbols: Vec<String> = watchlist.to_vec();
    for symbol in held {
        if !symbols.contains(symbol) {
            symbols.push(symbol.clone());
        }
    }
    symbols
}
