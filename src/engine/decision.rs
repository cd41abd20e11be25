//! Decision engine.
//!
//! One model call per run for the whole watchlist, plus at most one
//! repair call if the reply can't be parsed. Validated decisions come
//! back in reply order; anything that fails validation is dropped and
//! logged.

use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::parse::{self, ParsedDecisions, RejectedDecision};
use crate::llm::{prompt, LanguageModel};
use crate::risk::RiskLimits;
use crate::types::{Decision, Portfolio, TraderError, WatchlistQuote};

/// How the model reply was turned into decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// First reply parsed.
    Parsed,
    /// First reply failed; the repair reply parsed.
    Repaired,
    /// Both replies failed. The run continues with no decisions.
    Unparseable { error: String },
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseStatus::Parsed => write!(f, "parsed"),
            ParseStatus::Repaired => write!(f, "repaired"),
            ParseStatus::Unparseable { .. } => write!(f, "unparseable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionSet {
    pub decisions: Vec<Decision>,
    pub rejected: Vec<RejectedDecision>,
    pub parse: ParseStatus,
    pub market_mood: Option<String>,
    pub model_calls: u32,
}

impl DecisionSet {
    fn from_parsed(parsed: ParsedDecisions, parse: ParseStatus, model_calls: u32) -> Self {
        Self {
            decisions: parsed.decisions,
            rejected: parsed.rejected,
            parse,
            market_mood: parsed.market_mood,
            model_calls,
        }
    }

    fn unparseable(error: String, model_calls: u32) -> Self {
        Self {
            decisions: Vec::new(),
            rejected: Vec::new(),
            parse: ParseStatus::Unparseable { error },
            market_mood: None,
            model_calls,
        }
    }
}

pub struct DecisionEngine {
    model: Arc<dyn LanguageModel>,
}

impl DecisionEngine {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Ask the model for decisions on `quotes`.
    ///
    /// Errors only when the first call can't reach the model. Parse
    /// failures, including a failed repair call, yield an
    /// `Unparseable` set with no decisions.
    pub async fn decide(
        &self,
        quotes: &[WatchlistQuote],
        portfolio: &Portfolio,
        forced_exits: &[Decision],
        limits: &RiskLimits,
    ) -> Result<DecisionSet, TraderError> {
        if quotes.is_empty() {
            return Ok(DecisionSet::from_parsed(
                ParsedDecisions::default(),
                ParseStatus::Parsed,
                0,
            ));
        }

        let allowed: Vec<&str> = quotes.iter().map(|q| q.symbol.as_str()).collect();
        let system = prompt::system_prompt();
        let request = prompt::build_decision_prompt(quotes, portfolio, forced_exits, limits);

        info!(model = %self.model_name(), symbols = quotes.len(), "Requesting decisions");
        let first = self
            .model
            .complete(system, &request)
            .await
            .map_err(|e| TraderError::Model {
                model: self.model_name().to_string(),
                message: format!("{e:#}"),
            })?;
        info!(tokens = first.tokens_used, "Model replied");

        let set = match parse::parse_decisions(&first.text, &allowed) {
            Ok(parsed) => DecisionSet::from_parsed(parsed, ParseStatus::Parsed, 1),
            Err(first_error) => {
                warn!(error = %first_error, "Model reply unparseable, requesting repair");
                let repair =
                    prompt::build_repair_prompt(&request, &first.text, &first_error.to_string());
                match self.model.complete(system, &repair).await {
                    Ok(second) => match parse::parse_decisions(&second.text, &allowed) {
                        Ok(parsed) => DecisionSet::from_parsed(parsed, ParseStatus::Repaired, 2),
                        Err(e) => DecisionSet::unparseable(e.to_string(), 2),
                    },
                    Err(e) => DecisionSet::unparseable(format!("repair request failed: {e:#}"), 2),
                }
            }
        };

        for rejected in &set.rejected {
            warn!(index = rejected.index, reason = %rejected.reason, "Decision dropped");
        }
        if let ParseStatus::Unparseable { error } = &set.parse {
            warn!(
                error = %error,
                "Model output UNPARSEABLE after repair, proceeding with no decisions"
            );
        }
        info!(
            decisions = set.decisions.len(),
            dropped = set.rejected.len(),
            parse = %set.parse,
            "Decisions parsed"
        );

        Ok(set)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
