//! ANPS: per-operation heuristic quality scoring and submission.
//!
//! Runs once a turn has fully resolved (no outstanding validation). Every
//! distinct operation invoked through the generic executor gets a 0–10
//! score from attempts, errors, and duration against an operation-class
//! baseline; with two or more scored operations a turn-summary
//! pseudo-operation is scored once on top. Submission happens on a
//! detached thread and never touches the primary answer path.

use crate::feedback::{generate_feedback, status_digest};
use chrono::Utc;
use opspilot_core::{
    AgentNpsEvaluation, EXECUTE_TOOL, EntryKind, HistoryEntry, SUBMIT_SCORE_TOOL, ScoringConfig,
    normalize_ident,
};
use opspilot_gateway::Gateway;
use opspilot_llm::PlannerClient;
use opspilot_observe::Observer;
use opspilot_store::{AnpsSubmissionRecord, Store};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use uuid::Uuid;

/// Pseudo-operation id for the turn-level aggregate evaluation.
pub const TURN_SUMMARY_OPERATION: &str = "turn_summary";

#[derive(Debug, Default)]
struct OperationOutcome {
    attempts: u32,
    errors: u32,
    success: bool,
    last_status: Option<u16>,
    duration_ms: u64,
    last_error: Option<String>,
}

/// Evaluate every distinct operation executed in this turn, plus a
/// turn-summary aggregate when at least two operations were scored.
pub fn evaluate_turn(history: &[HistoryEntry], cfg: &ScoringConfig) -> Vec<AgentNpsEvaluation> {
    let mut operations: Vec<String> = Vec::new();
    for entry in history {
        if entry.kind == EntryKind::Call
            && entry.tool_name == EXECUTE_TOOL
            && let Some(op) = operation_of(entry)
            && !operations.contains(&op)
        {
            operations.push(op);
        }
    }

    let mut evaluations: Vec<AgentNpsEvaluation> = operations
        .iter()
        .map(|op| evaluate_operation(history, op, cfg))
        .collect();
    if evaluations.len() >= 2 {
        evaluations.push(turn_summary(&evaluations));
    }
    evaluations
}

fn operation_of(entry: &HistoryEntry) -> Option<String> {
    entry
        .tool_args
        .get("operation_id")?
        .as_str()
        .map(normalize_ident)
}

pub fn evaluate_operation(
    history: &[HistoryEntry],
    operation_id: &str,
    cfg: &ScoringConfig,
) -> AgentNpsEvaluation {
    let outcome = scan_operation(history, operation_id);
    let expected_ms = expected_duration_ms(operation_id, cfg);
    let score = heuristic_score(&outcome, expected_ms);
    let error_flag = !outcome.success || outcome.errors > 0;

    let status_note = outcome
        .last_status
        .map(|s| format!(", last status {s}"))
        .unwrap_or_default();
    let resolution = if outcome.success {
        "resolved successfully"
    } else {
        "did not reach a successful response"
    };
    let feedback_note = format!(
        "operation {operation_id}: {} attempt(s), {} error(s){status_note}; {resolution} in {} ms (expected ~{} ms)",
        outcome.attempts, outcome.errors, outcome.duration_ms, expected_ms
    );

    AgentNpsEvaluation {
        operation_id: operation_id.to_string(),
        score,
        error_flag,
        error_summary: outcome.last_error,
        attempts: outcome.attempts,
        errors: outcome.errors,
        duration_ms: outcome.duration_ms,
        feedback_note,
    }
}

fn scan_operation(history: &[HistoryEntry], operation_id: &str) -> OperationOutcome {
    let mut outcome = OperationOutcome::default();
    for entry in history {
        if entry.kind != EntryKind::Call || entry.tool_name != EXECUTE_TOOL {
            continue;
        }
        if operation_of(entry).as_deref() != Some(operation_id) {
            continue;
        }
        outcome.attempts += 1;
        if let Some(meta) = &entry.meta {
            outcome.duration_ms += meta.duration_ms;
        }
        let status = status_code(entry);
        outcome.last_status = status.or(outcome.last_status);
        let is_error = entry.tool_result.is_error || status.is_some_and(|s| s >= 400);
        if is_error {
            outcome.errors += 1;
            outcome.last_error = Some(truncate(&entry.tool_result.joined_text(), 200));
        } else if status.map_or(true, |s| (200..300).contains(&s)) {
            outcome.success = true;
        }
    }
    outcome
}

fn status_code(entry: &HistoryEntry) -> Option<u16> {
    let payload = entry.tool_result.first_json_payload()?;
    payload.get("status")?.as_u64().map(|s| s as u16)
}

/// Score heuristic: start at 10 when successful, 4 otherwise; penalize
/// retries, errors, and overruns against the expected duration; clamp to
/// [0, 10] and round.
fn heuristic_score(outcome: &OperationOutcome, expected_ms: u64) -> u8 {
    let mut score: f64 = if outcome.success { 10.0 } else { 4.0 };
    score -= outcome.attempts.saturating_sub(1).min(3) as f64;
    score -= (outcome.errors * 2).min(6) as f64;
    score -= duration_penalty(outcome.duration_ms, expected_ms) as f64;
    score.clamp(0.0, 10.0).round() as u8
}

fn duration_penalty(actual_ms: u64, expected_ms: u64) -> u8 {
    if expected_ms == 0 {
        return 0;
    }
    let ratio = actual_ms as f64 / expected_ms as f64;
    if ratio <= 1.0 {
        0
    } else if ratio <= 2.0 {
        1
    } else if ratio <= 4.0 {
        2
    } else {
        3
    }
}

/// Expected wall time per operation class. Bulk price/promotion updates
/// and import/export jobs get longer baselines.
fn expected_duration_ms(operation_id: &str, cfg: &ScoringConfig) -> u64 {
    if operation_id.contains("price_list")
        || operation_id.contains("promotion")
        || operation_id.contains("batch")
        || operation_id.contains("bulk")
    {
        cfg.bulk_expected_ms
    } else if operation_id.contains("import") || operation_id.contains("export") {
        cfg.transfer_expected_ms
    } else {
        cfg.default_expected_ms
    }
}

fn turn_summary(evaluations: &[AgentNpsEvaluation]) -> AgentNpsEvaluation {
    let count = evaluations.len() as u32;
    let sum: u32 = evaluations.iter().map(|e| e.score as u32).sum();
    let average = (sum as f64 / count as f64).round() as u8;
    let best = evaluations.iter().max_by_key(|e| e.score);
    let worst = evaluations.iter().min_by_key(|e| e.score);
    let attempts = evaluations.iter().map(|e| e.attempts).sum();
    let errors = evaluations.iter().map(|e| e.errors).sum::<u32>();
    let duration_ms = evaluations.iter().map(|e| e.duration_ms).sum();

    let mut feedback_note = format!(
        "turn summary across {count} operations: average score {average}"
    );
    if let (Some(best), Some(worst)) = (best, worst) {
        feedback_note.push_str(&format!(
            ", best {} ({}), worst {} ({})",
            best.score, best.operation_id, worst.score, worst.operation_id
        ));
    }
    feedback_note.push_str(&format!(
        "; {attempts} total attempt(s), {errors} total error(s)"
    ));

    AgentNpsEvaluation {
        operation_id: TURN_SUMMARY_OPERATION.to_string(),
        score: average,
        error_flag: evaluations.iter().any(|e| e.error_flag),
        error_summary: None,
        attempts,
        errors,
        duration_ms,
        feedback_note,
    }
}

type SubmissionKey = (Uuid, String);

/// Detached submission pipeline with per-`(session, operation)` dedupe.
///
/// `scored` holds completed submissions; `pending` holds in-flight ones so
/// re-entrant scheduling cannot double-count.
pub struct AnpsSubmitter {
    gateway: Arc<dyn Gateway>,
    planner: Option<Arc<dyn PlannerClient>>,
    observer: Arc<Observer>,
    store: Option<Arc<Store>>,
    cfg: ScoringConfig,
    scored: Mutex<HashSet<SubmissionKey>>,
    pending: Mutex<HashSet<SubmissionKey>>,
}

impl AnpsSubmitter {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        planner: Option<Arc<dyn PlannerClient>>,
        observer: Arc<Observer>,
        store: Option<Arc<Store>>,
        cfg: ScoringConfig,
    ) -> Self {
        Self {
            gateway,
            planner,
            observer,
            store,
            cfg,
            scored: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    fn guard<'g>(
        set: &'g Mutex<HashSet<SubmissionKey>>,
    ) -> MutexGuard<'g, HashSet<SubmissionKey>> {
        set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule a detached submission. Returns `None` when the
    /// `(session, operation)` pair is already scored or in flight.
    pub fn schedule(
        self: &Arc<Self>,
        session_id: Uuid,
        evaluation: AgentNpsEvaluation,
        history: Vec<HistoryEntry>,
    ) -> Option<JoinHandle<()>> {
        let key = (session_id, evaluation.operation_id.clone());
        {
            if Self::guard(&self.scored).contains(&key) {
                return None;
            }
            let mut pending = Self::guard(&self.pending);
            if !pending.insert(key.clone()) {
                return None;
            }
        }

        let this = Arc::clone(self);
        Some(std::thread::spawn(move || {
            this.submit(session_id, &evaluation, &history);
        }))
    }

    fn submit(&self, session_id: Uuid, evaluation: &AgentNpsEvaluation, history: &[HistoryEntry]) {
        let key = (session_id, evaluation.operation_id.clone());
        let ok = match self.try_submit(session_id, evaluation, history) {
            Ok(ok) => ok,
            Err(err) => {
                self.observer.warn_log(&format!(
                    "anps submission failed for {}: {err}",
                    evaluation.operation_id
                ));
                false
            }
        };
        Self::guard(&self.pending).remove(&key);
        if ok {
            Self::guard(&self.scored).insert(key);
        }
    }

    fn try_submit(
        &self,
        session_id: Uuid,
        evaluation: &AgentNpsEvaluation,
        history: &[HistoryEntry],
    ) -> anyhow::Result<bool> {
        let digest_operation = if evaluation.operation_id == TURN_SUMMARY_OPERATION {
            None
        } else {
            Some(evaluation.operation_id.as_str())
        };
        let digest = status_digest(history, digest_operation, self.cfg.status_digest_limit);
        let feedback = self
            .planner
            .as_deref()
            .and_then(|planner| generate_feedback(planner, evaluation, &digest));

        let record = json!({
            "session_id": session_id,
            "operation_id": evaluation.operation_id,
            "score": evaluation.score,
            "error_flag": evaluation.error_flag,
            "error_summary": evaluation.error_summary,
            "attempts": evaluation.attempts,
            "errors": evaluation.errors,
            "duration_ms": evaluation.duration_ms,
            "feedback_note": evaluation.feedback_note,
            "feedback": feedback,
        });

        let envelope = self.gateway.call_tool(SUBMIT_SCORE_TOOL, &record)?;
        let payload = envelope.first_json_payload();
        let ok = !envelope.is_error
            && payload
                .as_ref()
                .and_then(|p| p.get("ok"))
                .and_then(Value::as_bool)
                != Some(false);
        if !ok {
            let message = payload
                .as_ref()
                .and_then(|p| p.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("submission rejected");
            self.observer.warn_log(&format!(
                "anps submission not accepted for {}: {message}",
                evaluation.operation_id
            ));
        }

        if let Some(store) = &self.store {
            let _ = store.insert_anps_submission(&AnpsSubmissionRecord {
                session_id,
                operation_id: evaluation.operation_id.clone(),
                score: evaluation.score as i64,
                error_flag: evaluation.error_flag,
                payload_json: record.to_string(),
                ok,
                submitted_at: Utc::now().to_rfc3339(),
            });
        }
        Ok(ok)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
