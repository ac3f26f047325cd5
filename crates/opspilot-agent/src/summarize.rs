//! Payload summarization and numeric grounding.
//!
//! `summarize_payload` walks an arbitrary JSON tool result and emits
//! frequency aggregates of repeated scalar values per field path — the
//! agent quotes these instead of inventing counts. `ground_truth_numbers`
//! collects the business-meaningful numeric fields actually observed in a
//! payload so final answers can be checked against them.

use opspilot_core::{CountSummary, ValueCount};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Stand-in for whitespace-only strings so they still aggregate.
const EMPTY_SENTINEL: &str = "(empty)";

/// Counts per path are truncated to this many distinct values.
const MAX_VALUES_PER_PATH: usize = 10;

/// Numeric keys considered ground truth when they appear in a payload.
pub const GROUND_TRUTH_KEYS: &[&str] = &[
    "total",
    "subtotal",
    "amount",
    "quantity",
    "price",
    "unit_price",
    "count",
    "stocked_quantity",
    "inventory_quantity",
    "discount_total",
    "tax_total",
];

/// Upper bound on collected ground-truth fields per payload.
const MAX_GROUND_TRUTH_FIELDS: usize = 24;

/// Frequency aggregates of repeated scalars per field path. Paths where no
/// value recurs carry no signal and are dropped; `None` when nothing
/// qualifies.
pub fn summarize_payload(payload: &Value) -> Option<Vec<CountSummary>> {
    let mut counts: HashMap<String, HashMap<String, u64>> = HashMap::new();
    walk(payload, String::new(), &mut counts);

    let mut summaries: Vec<CountSummary> = counts
        .into_iter()
        .filter(|(_, values)| values.values().any(|c| *c > 1))
        .map(|(path, values)| {
            let total = values.values().sum();
            let unique = values.len() as u64;
            let mut counts: Vec<ValueCount> = values
                .into_iter()
                .map(|(value, count)| ValueCount { value, count })
                .collect();
            counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
            counts.truncate(MAX_VALUES_PER_PATH);
            let top = counts.first().map(|c| c.value.clone());
            CountSummary {
                path,
                total,
                unique,
                counts,
                top,
            }
        })
        .collect();

    if summaries.is_empty() {
        return None;
    }
    summaries.sort_by(|a, b| {
        let top_a = a.counts.first().map(|c| c.count).unwrap_or(0);
        let top_b = b.counts.first().map(|c| c.count).unwrap_or(0);
        top_b.cmp(&top_a).then_with(|| a.path.cmp(&b.path))
    });
    Some(summaries)
}

fn walk(value: &Value, path: String, counts: &mut HashMap<String, HashMap<String, u64>>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk(child, child_path, counts);
            }
        }
        Value::Array(items) => {
            let child_path = format!("{path}[]");
            for item in items {
                walk(item, child_path.clone(), counts);
            }
        }
        Value::Null => {}
        scalar => {
            if path.is_empty() {
                return;
            }
            *counts
                .entry(path)
                .or_default()
                .entry(normalize_scalar(scalar))
                .or_insert(0) += 1;
        }
    }
}

/// Normalized text form of a scalar: trimmed strings, integer-collapsed
/// numbers, `true`/`false` booleans, a sentinel for empty strings.
pub fn normalize_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                EMPTY_SENTINEL.to_string()
            } else {
                trimmed.to_string()
            }
        }
        Value::Number(n) => {
            if let Some(f) = n.as_f64()
                && f.fract() == 0.0
                && f.abs() < 1e15
            {
                format!("{}", f as i64)
            } else {
                n.to_string()
            }
        }
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Path → number map for allow-listed numeric keys observed anywhere in
/// the payload. First occurrence per path wins; bounded.
pub fn ground_truth_numbers(payload: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    collect_numbers(payload, String::new(), &mut out);
    out
}

fn collect_numbers(value: &Value, path: String, out: &mut Map<String, Value>) {
    if out.len() >= MAX_GROUND_TRUTH_FIELDS {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                if child.is_number() && GROUND_TRUTH_KEYS.contains(&key.as_str()) {
                    if out.len() < MAX_GROUND_TRUTH_FIELDS && !out.contains_key(&child_path) {
                        out.insert(child_path, child.clone());
                    }
                } else {
                    collect_numbers(child, child_path, out);
                }
            }
        }
        Value::Array(items) => {
            let child_path = format!("{path}[]");
            for item in items {
                collect_numbers(item, child_path.clone(), out);
            }
        }
        _ => {}
    }
}
