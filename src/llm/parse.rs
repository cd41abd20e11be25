//! Model reply normalization and decision parsing.
//!
//! `normalize` strips code fences and surrounding prose down to the JSON
//! payload; `parse_decisions` turns that payload into validated
//! `Decision`s. Invalid elements are rejected one by one and never fail
//! the whole parse.

use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

use crate::types::{Action, Decision};

/// The reply contained no usable JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no JSON array or object found in reply")]
    NoJson,

    #[error("malformed JSON: {0}")]
    Malformed(String),

    #[error("unexpected JSON shape: {0}")]
    UnexpectedShape(String),
}

/// Element that failed validation, by position in the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDecision {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDecisions {
    pub decisions: Vec<Decision>,
    pub rejected: Vec<RejectedDecision>,
    pub market_mood: Option<String>,
}

/// Slice out the JSON payload.
///
/// A fenced block is searched first. Otherwise the first `[` or `{` that
/// starts a complete JSON value wins, so brackets in surrounding prose are
/// skipped. Failing both, the outermost `[...]` or `{...}` pair is returned
/// so the parse error points at the broken payload.
pub fn normalize(text: &str) -> Option<&str> {
    if let Some(payload) = fenced_block(text).and_then(first_payload) {
        return Some(payload);
    }
    first_payload(text).or_else(|| outermost_span(text))
}

/// Body of the first ```` ``` ```` fence, language tag included.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")? + 3;
    let len = text[open..].find("```")?;
    Some(&text[open..open + len])
}

fn first_payload(text: &str) -> Option<&str> {
    text.char_indices()
        .filter(|(_, c)| matches!(*c, '[' | '{'))
        .find_map(|(start, _)| payload_at(text, start))
}

/// Complete JSON value starting at `start` that could hold decisions.
fn payload_at(text: &str, start: usize) -> Option<&str> {
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    let value = stream.next()?.ok()?;
    let plausible = match &value {
        Value::Object(_) => true,
        Value::Array(items) => items.is_empty() || items.iter().any(Value::is_object),
        _ => false,
    };
    plausible.then(|| &text[start..start + stream.byte_offset()])
}

fn outermost_span(text: &str) -> Option<&str> {
    let span = |open: char, close: char| -> Option<(usize, usize)> {
        let start = text.find(open)?;
        let end = text.rfind(close)?;
        (end > start).then_some((start, end))
    };

    let chosen = match (span('[', ']'), span('{', '}')) {
        (Some(arr), Some(obj)) if obj.0 < arr.0 && obj.1 > arr.1 => obj,
        (Some(arr), _) => arr,
        (None, Some(obj)) => obj,
        (None, None) => return None,
    };
    Some(&text[chosen.0..=chosen.1])
}

/// Parse a model reply into decisions for `allowed_symbols`.
pub fn parse_decisions(
    text: &str,
    allowed_symbols: &[&str],
) -> Result<ParsedDecisions, ParseError> {
    let payload = normalize(text).ok_or(ParseError::NoJson)?;
    let value: Value =
        serde_json::from_str(payload).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let (items, market_mood) = match value {
        Value::Array(items) => (items, None),
        Value::Object(mut map) => {
            let mood = map
                .get("market_mood")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            match map.remove("decisions") {
                Some(Value::Array(items)) => (items, mood),
                Some(other) => {
                    return Err(ParseError::UnexpectedShape(format!(
                        "\"decisions\" is {}, expected an array",
                        type_name(&other)
                    )))
                }
                None if map.contains_key("symbol") || map.contains_key("ticker") => {
                    (vec![Value::Object(map)], mood)
                }
                None => {
                    return Err(ParseError::UnexpectedShape(
                        "object without a \"decisions\" array".to_string(),
                    ))
                }
            }
        }
        other => {
            return Err(ParseError::UnexpectedShape(format!(
                "top level is {}",
                type_name(&other)
            )))
        }
    };

    let mut parsed = ParsedDecisions {
        market_mood,
        ..Default::default()
    };
    let mut seen = HashSet::new();

    for (index, item) in items.iter().enumerate() {
        match validate(item, allowed_symbols) {
            Ok(decision) => {
                if seen.insert(decision.symbol.clone()) {
                    parsed.decisions.push(decision);
                } else {
                    parsed.rejected.push(RejectedDecision {
                        index,
                        reason: format!("duplicate decision for {}", decision.symbol),
                    });
                }
            }
            Err(reason) => parsed.rejected.push(RejectedDecision { index, reason }),
        }
    }

    Ok(parsed)
}

fn validate(item: &Value, allowed_symbols: &[&str]) -> Result<Decision, String> {
    let obj = item
        .as_object()
        .ok_or_else(|| format!("element is {}, expected an object", type_name(item)))?;

    let raw_symbol = field_str(obj, "symbol")
        .or_else(|| field_str(obj, "ticker"))
        .ok_or("missing symbol")?;
    let symbol = allowed_symbols
        .iter()
        .find(|s| s.eq_ignore_ascii_case(raw_symbol.trim()))
        .ok_or_else(|| format!("unknown symbol {raw_symbol}"))?;

    let raw_action = field_str(obj, "action").ok_or("missing action")?;
    let action: Action = raw_action
        .parse()
        .map_err(|_| format!("invalid action {raw_action}"))?;

    let quantity = match obj.get("quantity") {
        None | Some(Value::Null) if action == Action::Hold => 0,
        None | Some(Value::Null) => return Err(format!("missing quantity for {action}")),
        Some(v) => parse_quantity(v)?,
    };
    let quantity = if action == Action::Hold && quantity > 0 {
        debug!(symbol = %symbol, quantity, "HOLD quantity normalized to 0");
        0
    } else {
        quantity
    };

    let reason = field_str(obj, "reason").unwrap_or("").trim();

    Ok(Decision::new(symbol, action, quantity, reason))
}

/// Non-negative integer; integral floats like `10.0` are accepted.
fn parse_quantity(v: &Value) -> Result<u64, String> {
    if let Some(q) = v.as_u64() {
        return Ok(q);
    }
    if let Some(q) = v.as_i64() {
        return Err(format!("negative quantity {q}"));
    }
    match v.as_f64() {
        Some(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => {
            Ok(f as u64)
        }
        Some(f) if f < 0.0 => Err(format!("negative quantity {f}")),
        Some(f) => Err(format!("fractional quantity {f}")),
        None => Err(format!("quantity is {}, expected a number", type_name(v))),
    }
}

fn field_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ALLOWED: &[&str] = &["AAPL", "NVDA", "ASML"];

    const BARE: &str = r#"[
        {"symbol": "AAPL", "action": "BUY", "quantity": 10, "reason": "New chip launch"},
        {"symbol": "NVDA", "action": "HOLD", "quantity": 0, "reason": "Waiting on earnings"}
    ]"#;

    #[test]
    fn test_normalize_bare_array() {
        assert_eq!(normalize(BARE), Some(BARE));
    }

    #[test]
    fn test_normalize_strips_fences_and_prose() {
        let wrapped = format!("Sure! Here are my picks:\n```json\n{BARE}\n```\nGood luck.");
        assert_eq!(normalize(&wrapped), Some(BARE));
    }

    #[test]
    fn test_normalize_prefers_enclosing_object() {
        let text = r#"{"market_mood": "calm", "decisions": [{"symbol":"AAPL"}]}"#;
        assert_eq!(normalize(text), Some(text));
    }

    #[test]
    fn test_normalize_nothing() {
        assert_eq!(normalize("I cannot help with that."), None);
        assert_eq!(normalize("] backwards ["), None);
    }

    #[test]
    fn test_normalize_skips_brackets_in_prose() {
        let wrapped = format!("Decisions for [AAPL]:\n```json\n{BARE}\n```\nDone.");
        assert_eq!(normalize(&wrapped), Some(BARE));

        let trailing = format!("```json\n{BARE}\n```\nSee note [1].");
        assert_eq!(normalize(&trailing), Some(BARE));

        let unfenced = format!("Per note [1] and {{risk}}: {BARE} (see [2])");
        assert_eq!(normalize(&unfenced), Some(BARE));
    }

    #[test]
    fn test_bracketed_prose_parses_like_bare() {
        let bare = parse_decisions(BARE, ALLOWED).unwrap();
        for text in [
            format!("Decisions for [AAPL]:\n```json\n{BARE}\n```\nDone."),
            format!("```json\n{BARE}\n```\nSee note [1]."),
        ] {
            assert_eq!(parse_decisions(&text, ALLOWED).unwrap(), bare);
        }
    }

    #[test]
    fn test_fenced_reply_parses_like_bare() {
        let wrapped = format!("Analysis below.\n```json\n{BARE}\n```\nLet me know!");
        let bare = parse_decisions(BARE, ALLOWED).unwrap();
        let fenced = parse_decisions(&wrapped, ALLOWED).unwrap();
        assert_eq!(bare, fenced);
        assert_eq!(bare.decisions.len(), 2);
    }

    #[test]
    fn test_parse_fields() {
        let parsed = parse_decisions(BARE, ALLOWED).unwrap();
        assert_eq!(
            parsed.decisions[0],
            Decision::new("AAPL", Action::Buy, 10, "New chip launch")
        );
        assert_eq!(parsed.decisions[1].action, Action::Hold);
        assert!(parsed.rejected.is_empty());
        assert!(parsed.market_mood.is_none());
    }

    #[test]
    fn test_parse_wrapped_object_with_mood_and_ticker_alias() {
        let text = r#"{
            "market_mood": "cautious - rates uncertainty",
            "decisions": [
                {"ticker": "asml", "action": "sell", "quantity": 5.0,
                 "confidence": "high", "reason": "Guidance cut"}
            ]
        }"#;
        let parsed = parse_decisions(text, ALLOWED).unwrap();
        assert_eq!(parsed.market_mood.as_deref(), Some("cautious - rates uncertainty"));
        assert_eq!(parsed.decisions, vec![Decision::new("ASML", Action::Sell, 5, "Guidance cut")]);
    }

    #[test]
    fn test_hold_quantity_normalized() {
        let text = r#"[{"symbol":"AAPL","action":"HOLD","quantity":25,"reason":"r"},
                       {"symbol":"NVDA","action":"hold"}]"#;
        let parsed = parse_decisions(text, ALLOWED).unwrap();
        assert_eq!(parsed.decisions.len(), 2);
        assert!(parsed.decisions.iter().all(|d| d.quantity == 0));
        assert_eq!(parsed.decisions[1].reason, "");
    }

    #[test]
    fn test_invalid_elements_rejected_individually() {
        let text = r#"[
            {"symbol":"TSLA","action":"BUY","quantity":1},
            {"symbol":"AAPL","action":"SHORT","quantity":1},
            {"symbol":"AAPL","action":"BUY","quantity":-3},
            {"symbol":"AAPL","action":"BUY","quantity":2.5},
            {"symbol":"AAPL","action":"BUY","quantity":"ten"},
            {"symbol":"AAPL","action":"BUY"},
            "AAPL",
            {"action":"BUY","quantity":1},
            {"symbol":"NVDA","action":"BUY","quantity":4,"reason":"ok"}
        ]"#;
        let parsed = parse_decisions(text, ALLOWED).unwrap();
        assert_eq!(parsed.decisions, vec![Decision::new("NVDA", Action::Buy, 4, "ok")]);
        let indices: Vec<usize> = parsed.rejected.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(parsed.rejected[0].reason.contains("unknown symbol"));
        assert!(parsed.rejected[2].reason.contains("negative"));
        assert!(parsed.rejected[3].reason.contains("fractional"));
    }

    #[test]
    fn test_duplicate_symbol_keeps_first() {
        let text = r#"[{"symbol":"AAPL","action":"BUY","quantity":1},
                       {"symbol":"aapl","action":"SELL","quantity":1}]"#;
        let parsed = parse_decisions(text, ALLOWED).unwrap();
        assert_eq!(parsed.decisions.len(), 1);
        assert_eq!(parsed.decisions[0].action, Action::Buy);
        assert_eq!(parsed.rejected.len(), 1);
        assert!(parsed.rejected[0].reason.contains("duplicate"));
    }

    #[test]
    fn test_empty_array_is_valid() {
        let parsed = parse_decisions("[]", ALLOWED).unwrap();
        assert!(parsed.decisions.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_decisions("no json here", ALLOWED), Err(ParseError::NoJson));
        assert!(matches!(
            parse_decisions("[{\"symbol\": \"AAPL\",]", ALLOWED),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_decisions(r#"{"decisions": "none"}"#, ALLOWED),
            Err(ParseError::UnexpectedShape(_))
        ));
        assert!(matches!(
            parse_decisions(r#"{"status": "ok"}"#, ALLOWED),
            Err(ParseError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn test_single_object_reply_accepted() {
        let parsed =
            parse_decisions(r#"{"symbol":"AAPL","action":"BUY","quantity":3}"#, ALLOWED).unwrap();
        assert_eq!(parsed.decisions.len(), 1);
    }
}
