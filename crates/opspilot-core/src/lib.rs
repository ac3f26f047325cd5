use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Generic backend-operation executor exposed by the tool gateway.
pub const EXECUTE_TOOL: &str = "api.execute";
/// Schema metadata lookup for a single operation id.
pub const SCHEMA_TOOL: &str = "api.schema";
/// Quality-score submission sink.
pub const SUBMIT_SCORE_TOOL: &str = "api.submit_score";

/// Answer emitted when the planner output cannot be understood at all.
pub const FALLBACK_ANSWER: &str =
    "I was unable to decide on a next action for this request. Please rephrase or add detail.";

/// Answer emitted when a human rejects a pending destructive operation.
pub const NOT_APPROVED_ANSWER: &str =
    "The requested operation was not approved, so nothing was changed.";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".opspilot")
}

/// Lowercase snake_case form of an identifier-like token. Operation ids and
/// planner action names arrive in mixed camelCase/kebab/space styles.
pub fn normalize_ident(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for ch in raw.trim().chars() {
        if ch == '-' || ch == ' ' {
            out.push('_');
            prev_lower = false;
        } else if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out.trim_matches('_').to_string()
}

// ── Planner decision ─────────────────────────────────────────────────────

/// Normalized planner decision. Exactly one variant; anything the normalizer
/// cannot understand becomes `FinalAnswer` with [`FALLBACK_ANSWER`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Plan {
    FinalAnswer {
        answer: Option<String>,
    },
    CallTool {
        tool_name: String,
        tool_args: serde_json::Map<String, serde_json::Value>,
    },
}

impl Plan {
    pub fn fallback() -> Self {
        Plan::FinalAnswer {
            answer: Some(FALLBACK_ANSWER.to_string()),
        }
    }
}

// ── Gateway envelope ─────────────────────────────────────────────────────

/// One content block in a gateway tool result. Text blocks carrying JSON are
/// the only payload channel; everything else is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolEnvelope {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolEnvelope {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        Self::from_text(value.to_string())
    }

    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: true,
        }
    }

    /// First text block that parses as JSON. Non-JSON text is opaque.
    pub fn first_json_payload(&self) -> Option<serde_json::Value> {
        self.content
            .iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text.as_deref())
            .find_map(|t| serde_json::from_str(t).ok())
    }

    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A tool advertised by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

// ── Turn history ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A real gateway invocation (or a verbatim copy of one).
    Call,
    /// Synthetic note, e.g. a suppressed duplicate explanation.
    Note,
    /// Synthetic aggregate entry produced by the payload summarizer.
    Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMeta {
    pub duration_ms: u64,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
}

/// Append-only record of one tool invocation (or synthetic annotation)
/// within a conversational turn. Ordering is significant; the last entry is
/// the most recent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub kind: EntryKind,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub tool_result: ToolEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ToolMeta>,
}

impl HistoryEntry {
    pub fn is_synthetic(&self) -> bool {
        !matches!(self.kind, EntryKind::Call)
    }

    pub fn payload(&self) -> Option<serde_json::Value> {
        self.tool_result.first_json_payload()
    }
}

// ── Validation ───────────────────────────────────────────────────────────

/// Human-approval request created for a destructive operation before it
/// executes. Immutable once created; lives in the process-wide registry
/// until resolved or expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub id: Uuid,
    pub operation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_field_enums: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_field_read_only: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_preview: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ── Quality scoring ──────────────────────────────────────────────────────

/// Heuristic per-operation quality evaluation, computed once a turn has
/// fully resolved. Score is always an integer in [0, 10].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNpsEvaluation {
    pub operation_id: String,
    pub score: u8,
    pub error_flag: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    pub attempts: u32,
    pub errors: u32,
    pub duration_ms: u64,
    pub feedback_note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueCount {
    pub value: String,
    pub count: u64,
}

/// Frequency aggregate of repeated scalar values at one JSON path.
/// Computed fresh per tool payload, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountSummary {
    pub path: String,
    pub total: u64,
    pub unique: u64,
    pub counts: Vec<ValueCount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<String>,
}

// ── Events ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    TurnStartedV1 {
        prompt: String,
    },
    PlanDecidedV1 {
        action: String,
    },
    ToolCalledV1 {
        tool_name: String,
        duration_ms: u64,
        success: bool,
    },
    DuplicateSuppressedV1 {
        tool_name: String,
    },
    ValidationRequestedV1 {
        request_id: Uuid,
        operation_id: String,
    },
    ValidationResolvedV1 {
        request_id: Uuid,
        approved: bool,
    },
    LoopFinishedV1 {
        steps: u32,
    },
    LoopFailedV1 {
        reason: String,
    },
    AnpsScoredV1 {
        operation_id: String,
        score: u8,
    },
    AnpsSubmitFailedV1 {
        operation_id: String,
        message: String,
    },
}

// ── Configuration ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentLoopConfig,
    pub dedupe: DedupeConfig,
    pub scoring: ScoringConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            agent: AgentLoopConfig::default(),
            dedupe: DedupeConfig::default(),
            scoring: ScoringConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable consulted for the API key.
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub max_output_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPSPILOT_API_KEY".to_string(),
            timeout_seconds: 120,
            max_retries: 3,
            retry_base_ms: 1000,
            max_output_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLoopConfig {
    /// Hard step budget per turn; doubles as the implicit retry limit.
    pub max_steps: u32,
    pub validation_ttl_seconds: u64,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            validation_ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// Tools eligible for approximate (timestamp-tolerant) duplicate
    /// matching. Exact-key dedupe applies to every cacheable call.
    pub approx_tools: Vec<String>,
    pub timestamp_tolerance_secs: i64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            approx_tools: vec![EXECUTE_TOOL.to_string()],
            timestamp_tolerance_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub enabled: bool,
    /// Expected wall time for an ordinary operation.
    pub default_expected_ms: u64,
    /// Expected wall time for known-slow bulk operations (price lists,
    /// promotions, batch jobs).
    pub bulk_expected_ms: u64,
    pub transfer_expected_ms: u64,
    /// Max lines in the status digest handed to the feedback model.
    pub status_digest_limit: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_expected_ms: 8_000,
            bulk_expected_ms: 30_000,
            transfer_expected_ms: 20_000,
            status_digest_limit: 12,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

impl AppConfig {
    pub fn settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Load settings.json, falling back to the legacy TOML file, falling
    /// back to defaults. Unknown fields are ignored; missing ones default.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::settings_path(workspace);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&raw)?);
        }
        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(&legacy)?;
            return Ok(toml::from_str(&raw)?);
        }
        Ok(Self::default())
    }

    /// Load, writing the default settings file first if none exists.
    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::settings_path(workspace);
        if !path.exists() {
            let cfg = Self::default();
            cfg.save(workspace)?;
            return Ok(cfg);
        }
        Self::load(workspace)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::settings_path(workspace);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_ident_handles_mixed_styles() {
        assert_eq!(normalize_ident("createProduct"), "create_product");
        assert_eq!(normalize_ident("Update-Price List"), "update_price_list");
        assert_eq!(normalize_ident("delete_customer"), "delete_customer");
        assert_eq!(normalize_ident("  FINAL "), "final");
    }

    #[test]
    fn envelope_payload_extraction_skips_non_json() {
        let envelope = ToolEnvelope {
            content: vec![
                ToolContent::text("plain prose, not a payload"),
                ToolContent::text(r#"{"status":200,"items":[1,2]}"#),
            ],
            is_error: false,
        };
        let payload = envelope.first_json_payload().expect("payload");
        assert_eq!(payload["status"], json!(200));
    }

    #[test]
    fn config_round_trips_through_settings_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = AppConfig::ensure(dir.path()).expect("ensure");
        cfg.agent.max_steps = 3;
        cfg.save(dir.path()).expect("save");
        let loaded = AppConfig::load(dir.path()).expect("load");
        assert_eq!(loaded.agent.max_steps, 3);
        assert_eq!(loaded.dedupe.timestamp_tolerance_secs, 90);
        assert_eq!(loaded.dedupe.approx_tools, vec![EXECUTE_TOOL.to_string()]);
    }

    #[test]
    fn config_tolerates_partial_settings() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"agent":{"max_steps":2}}"#).expect("partial settings");
        assert_eq!(cfg.agent.max_steps, 2);
        assert_eq!(cfg.llm.max_retries, 3);
    }

    #[test]
    fn history_entry_synthetic_flags() {
        let entry = HistoryEntry {
            kind: EntryKind::Note,
            tool_name: EXECUTE_TOOL.to_string(),
            tool_args: json!({}),
            tool_result: ToolEnvelope::from_text("duplicate suppressed"),
            meta: None,
        };
        assert!(entry.is_synthetic());
    }
}
