//! Qualitative feedback generation for scored operations.
//!
//! Best-effort by construction: any failure — missing credentials, an
//! empty response, unparseable JSON — yields `None` and the caller moves
//! on. This path must never block or fail the primary answer.

use opspilot_core::{AgentNpsEvaluation, EXECUTE_TOOL, EntryKind, HistoryEntry};
use opspilot_llm::PlannerClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const FEEDBACK_SYSTEM_PROMPT: &str = "You review how well an operations agent executed backend \
API operations. Respond with exactly one JSON object of the shape \
{\"feedback\": string, \"positives\": [string], \"suggestions\": [string]}. \
No markdown, no extra keys.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackResponse {
    pub feedback: String,
    #[serde(default)]
    pub positives: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Bounded digest of recent status outcomes, one line per executor call.
/// `operation_id = None` covers every operation (turn summaries).
pub fn status_digest(
    history: &[HistoryEntry],
    operation_id: Option<&str>,
    limit: usize,
) -> String {
    let lines: Vec<String> = history
        .iter()
        .filter(|entry| entry.kind == EntryKind::Call && entry.tool_name == EXECUTE_TOOL)
        .filter_map(|entry| {
            let op = entry.tool_args.get("operation_id")?.as_str()?;
            if let Some(wanted) = operation_id
                && opspilot_core::normalize_ident(op) != wanted
            {
                return None;
            }
            let status = entry
                .tool_result
                .first_json_payload()
                .and_then(|p| p.get("status").and_then(Value::as_u64));
            let outcome = match status {
                Some(code) => code.to_string(),
                None if entry.tool_result.is_error => "error".to_string(),
                None => "ok".to_string(),
            };
            Some(format!("{op} -> {outcome}"))
        })
        .collect();
    let skipped = lines.len().saturating_sub(limit);
    lines[skipped..].join("\n")
}

/// Ask the LLM for qualitative feedback on one evaluation. `None` on any
/// failure.
pub fn generate_feedback(
    planner: &dyn PlannerClient,
    evaluation: &AgentNpsEvaluation,
    digest: &str,
) -> Option<FeedbackResponse> {
    let user = build_feedback_prompt(evaluation, digest);
    let value = planner.complete_json(FEEDBACK_SYSTEM_PROMPT, &user).ok()??;
    let response: FeedbackResponse = serde_json::from_value(value).ok()?;
    if response.feedback.trim().is_empty() {
        return None;
    }
    Some(response)
}

fn build_feedback_prompt(evaluation: &AgentNpsEvaluation, digest: &str) -> String {
    let mut out = format!(
        "Operation: {}\nScore: {}/10\nAttempts: {}\nErrors: {}\nDuration: {} ms\nSummary: {}\n",
        evaluation.operation_id,
        evaluation.score,
        evaluation.attempts,
        evaluation.errors,
        evaluation.duration_ms,
        evaluation.feedback_note,
    );
    if let Some(error_summary) = &evaluation.error_summary {
        out.push_str(&format!("Last error: {error_summary}\n"));
    }
    if !digest.is_empty() {
        out.push_str("\nRecent status outcomes:\n");
        out.push_str(digest);
        out.push('\n');
    }
    out
}
