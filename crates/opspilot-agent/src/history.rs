//! Per-turn history tracking.
//!
//! An append-only log of tool invocations and synthetic annotations for one
//! conversational turn. The tracker owns the dedupe cache; synthetic
//! entries (notes, summaries) are never candidates for `latest_payload` or
//! dedupe.

use crate::dedupe::ToolDedupeCache;
use opspilot_core::{
    CountSummary, DedupeConfig, EXECUTE_TOOL, EntryKind, HistoryEntry, SCHEMA_TOOL,
    SUBMIT_SCORE_TOOL, ToolEnvelope, ToolMeta,
};
use serde_json::{Value, json};

/// Whether a call is eligible for duplicate suppression. Only mutating
/// operations — generic-executor calls carrying a body — qualify.
pub fn is_cacheable(tool_name: &str, args: &Value) -> bool {
    tool_name == EXECUTE_TOOL && args.get("body").is_some_and(|body| !body.is_null())
}

fn is_meta_tool(tool_name: &str) -> bool {
    tool_name == SCHEMA_TOOL || tool_name == SUBMIT_SCORE_TOOL
}

pub struct HistoryTracker {
    entries: Vec<HistoryEntry>,
    dedupe: ToolDedupeCache,
}

impl HistoryTracker {
    pub fn new(cfg: DedupeConfig) -> Self {
        Self {
            entries: Vec::new(),
            dedupe: ToolDedupeCache::new(cfg),
        }
    }

    /// Rebuild a tracker from a history snapshot, replaying successful
    /// cacheable calls into the dedupe cache.
    pub fn from_entries(cfg: DedupeConfig, entries: Vec<HistoryEntry>) -> Self {
        let mut tracker = Self::new(cfg);
        for entry in entries {
            if entry.kind == EntryKind::Call && !entry.tool_result.is_error {
                let cacheable = is_cacheable(&entry.tool_name, &entry.tool_args);
                tracker.dedupe.set(
                    &entry.tool_name,
                    &entry.tool_args,
                    cacheable,
                    entry.clone(),
                );
            }
            tracker.entries.push(entry);
        }
        tracker
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<HistoryEntry> {
        self.entries
    }

    pub fn record_result(
        &mut self,
        tool_name: &str,
        args: Value,
        envelope: ToolEnvelope,
        meta: Option<ToolMeta>,
    ) {
        let entry = HistoryEntry {
            kind: EntryKind::Call,
            tool_name: tool_name.to_string(),
            tool_args: args,
            tool_result: envelope,
            meta,
        };
        if !entry.tool_result.is_error {
            let cacheable = is_cacheable(tool_name, &entry.tool_args);
            self.dedupe
                .set(tool_name, &entry.tool_args, cacheable, entry.clone());
        }
        self.entries.push(entry);
    }

    pub fn record_error(
        &mut self,
        tool_name: &str,
        args: Value,
        error: &Value,
        meta: Option<ToolMeta>,
    ) {
        self.entries.push(HistoryEntry {
            kind: EntryKind::Call,
            tool_name: tool_name.to_string(),
            tool_args: args,
            tool_result: ToolEnvelope {
                content: vec![opspilot_core::ToolContent::text(error.to_string())],
                is_error: true,
            },
            meta,
        });
    }

    /// Record a suppressed duplicate: a note explaining why the call was
    /// skipped, followed by a copy of the reused entry.
    pub fn record_duplicate(&mut self, tool_name: &str, args: &Value, reused: &HistoryEntry) {
        let note = json!({
            "note": "duplicate call suppressed; reusing the earlier result",
            "tool": tool_name,
            "reused_result": reused.payload().unwrap_or(Value::Null),
        });
        self.entries.push(HistoryEntry {
            kind: EntryKind::Note,
            tool_name: tool_name.to_string(),
            tool_args: args.clone(),
            tool_result: ToolEnvelope::from_json(&note),
            meta: None,
        });
        self.entries.push(reused.clone());
    }

    /// Record computed aggregates as a synthetic entry.
    pub fn record_summary(
        &mut self,
        tool_name: &str,
        summaries: &[CountSummary],
        grounding: &serde_json::Map<String, Value>,
    ) {
        let payload = json!({
            "assistant_summary": summaries,
            "ground_truth": grounding,
        });
        self.entries.push(HistoryEntry {
            kind: EntryKind::Summary,
            tool_name: tool_name.to_string(),
            tool_args: Value::Null,
            tool_result: ToolEnvelope::from_json(&payload),
            meta: None,
        });
    }

    pub fn cached_success(
        &self,
        tool_name: &str,
        args: &Value,
        cacheable: bool,
    ) -> Option<HistoryEntry> {
        self.dedupe.get(tool_name, args, cacheable).cloned()
    }

    /// Most recent non-meta tool result with an extractable JSON payload.
    pub fn latest_payload(&self) -> Option<Value> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| {
                entry.kind == EntryKind::Call
                    && !entry.tool_result.is_error
                    && !is_meta_tool(&entry.tool_name)
            })
            .find_map(|entry| entry.payload())
    }
}
