//! Duplicate-call suppression for mutating tool calls.
//!
//! The planner is non-deterministic and will happily repeat a
//! non-idempotent call it already made. Entries are keyed by a canonical
//! serialization of the arguments; for tools listed in
//! `DedupeConfig::approx_tools` a miss falls back to approximate matching
//! that tolerates clock jitter in timestamp-valued fields.

use chrono::{DateTime, NaiveDateTime, Utc};
use opspilot_core::{DedupeConfig, HistoryEntry};
use serde_json::Value;
use sha2::{Digest, Sha256};

struct CacheSlot {
    key: String,
    tool_name: String,
    args: Value,
    entry: HistoryEntry,
}

pub struct ToolDedupeCache {
    cfg: DedupeConfig,
    slots: Vec<CacheSlot>,
}

impl ToolDedupeCache {
    pub fn new(cfg: DedupeConfig) -> Self {
        Self {
            cfg,
            slots: Vec::new(),
        }
    }

    /// Look up a prior successful call. Read-only calls are never deduped —
    /// repeats are cheap and may intentionally re-fetch fresher data.
    pub fn get(&self, tool_name: &str, args: &Value, cacheable: bool) -> Option<&HistoryEntry> {
        if !cacheable {
            return None;
        }
        let key = cache_key(tool_name, args);
        if let Some(slot) = self.slots.iter().find(|slot| slot.key == key) {
            return Some(&slot.entry);
        }
        if !self.cfg.approx_tools.iter().any(|t| t == tool_name) {
            return None;
        }
        let tolerance = self.cfg.timestamp_tolerance_secs;
        self.slots
            .iter()
            .find(|slot| {
                slot.tool_name == tool_name && approx_args_equal(&slot.args, args, tolerance)
            })
            .map(|slot| &slot.entry)
    }

    pub fn set(&mut self, tool_name: &str, args: &Value, cacheable: bool, entry: HistoryEntry) {
        if !cacheable {
            return;
        }
        let key = cache_key(tool_name, args);
        self.slots.retain(|slot| slot.key != key);
        self.slots.push(CacheSlot {
            key,
            tool_name: tool_name.to_string(),
            args: args.clone(),
            entry,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Canonical cache key for a call: tool name plus a digest of the
/// deterministically-serialized arguments.
pub fn cache_key(tool_name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(args).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic JSON text: object keys sorted recursively, arrays and
/// scalars encoded as-is.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(*key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Approximate argument equality: every key/value pair must match exactly,
/// except string values under timestamp-suffixed keys, which compare equal
/// when they parse to instants within `tolerance_secs` of each other. This
/// absorbs planner-introduced "now" jitter without suppressing materially
/// different requests.
pub fn approx_args_equal(a: &Value, b: &Value, tolerance_secs: i64) -> bool {
    approx_eq(None, a, b, tolerance_secs)
}

fn approx_eq(key: Option<&str>, a: &Value, b: &Value, tolerance_secs: i64) -> bool {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            ma.len() == mb.len()
                && ma.iter().all(|(k, va)| {
                    mb.get(k)
                        .is_some_and(|vb| approx_eq(Some(k), va, vb, tolerance_secs))
                })
        }
        (Value::Array(xa), Value::Array(xb)) => {
            xa.len() == xb.len()
                && xa
                    .iter()
                    .zip(xb.iter())
                    .all(|(va, vb)| approx_eq(key, va, vb, tolerance_secs))
        }
        (Value::String(sa), Value::String(sb)) => {
            if let Some(k) = key
                && is_timestamp_key(k)
                && let (Some(ta), Some(tb)) = (parse_timestamp(sa), parse_timestamp(sb))
            {
                return (ta - tb).num_seconds().abs() <= tolerance_secs;
            }
            sa == sb
        }
        _ => a == b,
    }
}

fn is_timestamp_key(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.ends_with("_at")
        || k.ends_with("_date")
        || k.ends_with("_time")
        || k.ends_with("timestamp")
        || k == "date"
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        if trimmed.len() == 13
            && let Ok(millis) = trimmed.parse::<i64>()
        {
            return DateTime::from_timestamp_millis(millis);
        }
        if trimmed.len() == 10
            && let Ok(secs) = trimmed.parse::<i64>()
        {
            return DateTime::from_timestamp(secs, 0);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use opspilot_core::{EXECUTE_TOOL, EntryKind, ToolEnvelope};
    use serde_json::json;

    fn entry(args: &Value) -> HistoryEntry {
        HistoryEntry {
            kind: EntryKind::Call,
            tool_name: EXECUTE_TOOL.to_string(),
            tool_args: args.clone(),
            tool_result: ToolEnvelope::from_text(r#"{"status":201,"id":"prod_1"}"#),
            meta: None,
        }
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&json!({"b": 1, "a": 2})),
            r#"{"a":2,"b":1}"#
        );
    }

    #[test]
    fn exact_duplicate_is_found_and_non_cacheable_is_not() {
        let mut cache = ToolDedupeCache::new(DedupeConfig::default());
        let args = json!({"operation_id": "create_product", "body": {"title": "Mug"}});
        cache.set(EXECUTE_TOOL, &args, true, entry(&args));
        assert!(cache.get(EXECUTE_TOOL, &args, true).is_some());
        assert!(cache.get(EXECUTE_TOOL, &args, false).is_none());

        let read_args = json!({"operation_id": "list_products"});
        cache.set(EXECUTE_TOOL, &read_args, false, entry(&read_args));
        assert!(cache.get(EXECUTE_TOOL, &read_args, true).is_none());
    }

    #[test]
    fn timestamp_jitter_within_tolerance_matches() {
        let mut cache = ToolDedupeCache::new(DedupeConfig::default());
        let first = json!({
            "operation_id": "create_order",
            "body": {"created_at": "2026-08-07T10:00:00Z", "total": 90}
        });
        let second = json!({
            "operation_id": "create_order",
            "body": {"created_at": "2026-08-07T10:01:00Z", "total": 90}
        });
        cache.set(EXECUTE_TOOL, &first, true, entry(&first));
        assert!(cache.get(EXECUTE_TOOL, &second, true).is_some());
    }

    #[test]
    fn timestamp_jitter_beyond_tolerance_does_not_match() {
        let mut cache = ToolDedupeCache::new(DedupeConfig::default());
        let first = json!({
            "operation_id": "create_order",
            "body": {"created_at": "2026-08-07T10:00:00Z", "total": 90}
        });
        let second = json!({
            "operation_id": "create_order",
            "body": {"created_at": "2026-08-07T10:01:31Z", "total": 90}
        });
        cache.set(EXECUTE_TOOL, &first, true, entry(&first));
        assert!(cache.get(EXECUTE_TOOL, &second, true).is_none());
    }

    #[test]
    fn materially_different_bodies_do_not_match() {
        let mut cache = ToolDedupeCache::new(DedupeConfig::default());
        let first = json!({
            "operation_id": "create_order",
            "body": {"created_at": "2026-08-07T10:00:00Z", "total": 90}
        });
        let second = json!({
            "operation_id": "create_order",
            "body": {"created_at": "2026-08-07T10:00:10Z", "total": 120}
        });
        cache.set(EXECUTE_TOOL, &first, true, entry(&first));
        assert!(cache.get(EXECUTE_TOOL, &second, true).is_none());
    }

    #[test]
    fn approximate_matching_is_limited_to_configured_tools() {
        let mut cache = ToolDedupeCache::new(DedupeConfig {
            approx_tools: vec![],
            ..DedupeConfig::default()
        });
        let first = json!({"body": {"created_at": "2026-08-07T10:00:00Z"}});
        let second = json!({"body": {"created_at": "2026-08-07T10:00:30Z"}});
        cache.set(EXECUTE_TOOL, &first, true, entry(&first));
        assert!(cache.get(EXECUTE_TOOL, &second, true).is_none());
        assert!(cache.get(EXECUTE_TOOL, &first, true).is_some());
    }

    #[test]
    fn epoch_and_naive_timestamp_formats_parse() {
        assert!(parse_timestamp("2026-08-07 10:00:00").is_some());
        assert!(parse_timestamp("1754560800").is_some());
        assert!(parse_timestamp("1754560800123").is_some());
        assert!(parse_timestamp("not a time").is_none());
    }
}
