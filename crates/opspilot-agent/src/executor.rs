//! Single tool-call execution.
//!
//! Destructive operations (create/update/delete-style ids on the generic
//! executor tool) are not executed directly: the executor gathers schema
//! metadata and a resource preview, registers a validation request, and
//! returns it — the suspension point of the ask loop. Everything else goes
//! straight to the gateway, with summarizer output spliced into the result.

use crate::summarize::{ground_truth_numbers, summarize_payload};
use chrono::Utc;
use opspilot_core::{
    CountSummary, EXECUTE_TOOL, SCHEMA_TOOL, ToolContent, ToolEnvelope, ToolMeta,
    ValidationRequest, normalize_ident,
};
use opspilot_gateway::Gateway;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::LazyLock;
use std::time::Instant;
use uuid::Uuid;

static DESTRUCTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(create|update|delete|remove|cancel|archive)(_|$)")
        .expect("destructive operation pattern"));

/// Fields shown first in a resource preview when present.
const PREVIEW_PRIORITY_FIELDS: &[&str] = &["id", "name", "title", "email", "status", "sku", "handle"];

/// Fallback cap on preview fields pulled from an arbitrary entity.
const PREVIEW_MAX_FIELDS: usize = 6;

/// Structured failure captured from the gateway without raising. The ask
/// loop treats this as a per-step failure, not a fatal one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ExecutionError {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            data: None,
            result: None,
        }
    }

    fn from_envelope(envelope: &ToolEnvelope) -> Self {
        if let Some(payload) = envelope.first_json_payload()
            && payload.is_object()
        {
            return Self {
                message: payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("tool execution failed")
                    .to_string(),
                code: payload
                    .get("code")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
                data: payload.get("data").cloned().filter(|v| !v.is_null()),
                result: payload.get("result").cloned().filter(|v| !v.is_null()),
            };
        }
        Self::from_message(envelope.joined_text())
    }

    pub fn to_value(&self) -> Value {
        json!({
            "message": self.message,
            "code": self.code,
            "data": self.data,
            "result": self.result,
        })
    }
}

/// Outcome of executing one planned tool call.
pub enum ToolOutcome {
    Success {
        envelope: ToolEnvelope,
        meta: ToolMeta,
        summaries: Option<Vec<CountSummary>>,
        grounding: Map<String, Value>,
    },
    Failure {
        error: ExecutionError,
        meta: ToolMeta,
    },
    NeedsValidation(Box<ValidationRequest>),
}

pub struct ToolExecutor<'a> {
    gateway: &'a dyn Gateway,
}

impl<'a> ToolExecutor<'a> {
    pub fn new(gateway: &'a dyn Gateway) -> Self {
        Self { gateway }
    }

    pub fn execute(&self, tool_name: &str, args: &Value, bypass_validation: bool) -> ToolOutcome {
        if !bypass_validation
            && let Some(operation_id) = destructive_operation(tool_name, args)
        {
            let request = self.build_validation_request(&operation_id, args);
            return ToolOutcome::NeedsValidation(Box::new(request));
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        match self.gateway.call_tool(tool_name, args) {
            Ok(envelope) if envelope.is_error => ToolOutcome::Failure {
                error: ExecutionError::from_envelope(&envelope),
                meta: meta_since(started_at.timestamp_millis(), clock),
            },
            Ok(mut envelope) => {
                let payload = envelope.first_json_payload();
                let summaries = payload.as_ref().and_then(summarize_payload);
                let grounding = payload
                    .as_ref()
                    .map(ground_truth_numbers)
                    .unwrap_or_default();
                if summaries.is_some() || !grounding.is_empty() {
                    envelope.content.push(ToolContent::text(
                        json!({
                            "assistant_summary": &summaries,
                            "ground_truth": &grounding,
                        })
                        .to_string(),
                    ));
                }
                ToolOutcome::Success {
                    envelope,
                    meta: meta_since(started_at.timestamp_millis(), clock),
                    summaries,
                    grounding,
                }
            }
            Err(err) => ToolOutcome::Failure {
                error: ExecutionError::from_message(err.to_string()),
                meta: meta_since(started_at.timestamp_millis(), clock),
            },
        }
    }

    fn build_validation_request(&self, operation_id: &str, args: &Value) -> ValidationRequest {
        let schema = self.fetch_schema(operation_id);
        let resource_preview = self.fetch_preview(operation_id, args);
        let arg_str = |key: &str| {
            args.get(key)
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        };
        ValidationRequest {
            id: Uuid::now_v7(),
            operation_id: operation_id.to_string(),
            method: schema
                .as_ref()
                .and_then(|s| s.method.clone())
                .or_else(|| arg_str("method")),
            path: schema
                .as_ref()
                .and_then(|s| s.path.clone())
                .or_else(|| arg_str("path")),
            args: args.clone(),
            body_field_enums: schema.as_ref().and_then(|s| s.body_field_enums.clone()),
            body_field_read_only: schema.and_then(|s| s.body_field_read_only),
            resource_preview,
            created_at: Utc::now(),
        }
    }

    /// Schema metadata for one operation. Fetch failure is tolerated — the
    /// validation request just carries less context.
    fn fetch_schema(&self, operation_id: &str) -> Option<SchemaInfo> {
        let envelope = self
            .gateway
            .call_tool(SCHEMA_TOOL, &json!({"operation_id": operation_id}))
            .ok()?;
        if envelope.is_error {
            return None;
        }
        let payload = envelope.first_json_payload()?;
        Some(SchemaInfo {
            method: payload
                .get("method")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            path: payload
                .get("path")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            body_field_enums: payload
                .get("body_field_enums")
                .cloned()
                .filter(|v| !v.is_null()),
            body_field_read_only: payload
                .get("body_field_read_only")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        })
    }

    /// Compact preview of the resource a destructive operation targets,
    /// fetched through the paired read operation. Tolerates failure.
    fn fetch_preview(&self, operation_id: &str, args: &Value) -> Option<Value> {
        let path_params = args.get("path_params")?.as_object()?;
        if path_params.is_empty() {
            return None;
        }
        let read_operation = paired_read_operation(operation_id)?;
        let envelope = self
            .gateway
            .call_tool(
                EXECUTE_TOOL,
                &json!({"operation_id": read_operation, "path_params": path_params}),
            )
            .ok()?;
        if envelope.is_error {
            return None;
        }
        let payload = envelope.first_json_payload()?;
        Some(entity_preview(&payload))
    }
}

struct SchemaInfo {
    method: Option<String>,
    path: Option<String>,
    body_field_enums: Option<Value>,
    body_field_read_only: Option<Vec<String>>,
}

/// Operation id of a destructive call, when the tool/operation pair
/// requires human validation.
pub fn destructive_operation(tool_name: &str, args: &Value) -> Option<String> {
    if tool_name != EXECUTE_TOOL {
        return None;
    }
    let operation_id = args.get("operation_id")?.as_str()?;
    let normalized = normalize_ident(operation_id);
    DESTRUCTIVE_RE
        .is_match(&normalized)
        .then_some(normalized)
}

/// Paired read operation for a write operation: the leading verb token is
/// substituted with `get` (`update_product` → `get_product`).
pub fn paired_read_operation(operation_id: &str) -> Option<String> {
    let normalized = normalize_ident(operation_id);
    let (verb, rest) = normalized.split_once('_')?;
    matches!(
        verb,
        "create" | "update" | "delete" | "remove" | "cancel" | "archive"
    )
    .then(|| format!("get_{rest}"))
}

/// Single-entity summary for display: prioritized fields when present,
/// otherwise the first few populated scalar fields.
pub fn entity_preview(payload: &Value) -> Value {
    // Unwrap single-key wrappers like {"product": {...}}.
    let entity = match payload {
        Value::Object(map) if map.len() == 1 => {
            let inner = map.values().next();
            match inner {
                Some(v) if v.is_object() => v,
                _ => payload,
            }
        }
        _ => payload,
    };
    let Some(obj) = entity.as_object() else {
        return entity.clone();
    };

    let mut preview = Map::new();
    for key in PREVIEW_PRIORITY_FIELDS {
        if let Some(value) = obj.get(*key)
            && !value.is_null()
        {
            preview.insert((*key).to_string(), value.clone());
        }
    }
    if preview.len() < 2 {
        for (key, value) in obj {
            if preview.len() >= PREVIEW_MAX_FIELDS {
                break;
            }
            if (value.is_string() || value.is_number() || value.is_boolean())
                && !preview.contains_key(key)
            {
                preview.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(preview)
}

fn meta_since(started_at_ms: i64, clock: Instant) -> ToolMeta {
    let duration_ms = clock.elapsed().as_millis() as u64;
    ToolMeta {
        duration_ms,
        started_at_ms,
        finished_at_ms: started_at_ms + duration_ms as i64,
    }
}
