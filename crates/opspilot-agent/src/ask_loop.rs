//! The ask loop: a step-bounded plan/execute state machine.
//!
//! Each iteration consults the planner and either finalizes, suppresses a
//! duplicate, suspends for human validation, records a failure, or records
//! a result and advances. The loop is an explicit `while` over a step
//! counter; the only reified continuation is the [`ResumeState`] stored
//! when a turn suspends, because control genuinely returns to a human
//! before resuming.
//!
//! Failure surface: a planner error or an exhausted step budget is fatal
//! for the turn and returned as an error; a failed tool call is recorded
//! and retried implicitly through re-planning within the step budget.

use crate::executor::{ToolExecutor, ToolOutcome};
use crate::history::{HistoryTracker, is_cacheable};
use crate::plan::normalize_plan;
use crate::summarize::ground_truth_numbers;
use crate::validation::{PendingValidation, ResumeState, ValidationRegistry};
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use opspilot_core::{
    AgentLoopConfig, DedupeConfig, EXECUTE_TOOL, FALLBACK_ANSWER, HistoryEntry,
    NOT_APPROVED_ANSWER, Plan, ValidationRequest,
};
use opspilot_gateway::Gateway;
use opspilot_llm::{PlanRequest, PlannerClient};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Context for one conversational turn.
#[derive(Debug, Clone)]
pub struct AskContext {
    pub prompt: String,
    pub model: String,
    pub operation_hints: Vec<String>,
    pub actor_id: Option<String>,
    pub session_id: Uuid,
    pub message_id: Uuid,
    pub turn_started_at: DateTime<Utc>,
    pub user_wait_ms: u64,
}

impl AskContext {
    pub fn new(prompt: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            prompt: prompt.into(),
            model: String::new(),
            operation_hints: Vec::new(),
            actor_id: None,
            session_id,
            message_id: Uuid::now_v7(),
            turn_started_at: Utc::now(),
            user_wait_ms: 0,
        }
    }
}

/// Terminal result of driving the loop (for this request/response cycle —
/// a suspended turn resumes later through the registry).
#[derive(Debug)]
pub enum LoopOutcome {
    Finished {
        answer: String,
        history: Vec<HistoryEntry>,
        steps: u32,
    },
    Suspended {
        request: ValidationRequest,
        history: Vec<HistoryEntry>,
    },
}

pub struct AskLoop<'a> {
    planner: &'a dyn PlannerClient,
    gateway: &'a dyn Gateway,
    registry: &'a ValidationRegistry,
    agent_cfg: AgentLoopConfig,
    dedupe_cfg: DedupeConfig,
    max_output_tokens: u32,
    cancel: Arc<AtomicBool>,
}

impl<'a> AskLoop<'a> {
    pub fn new(
        planner: &'a dyn PlannerClient,
        gateway: &'a dyn Gateway,
        registry: &'a ValidationRegistry,
        agent_cfg: AgentLoopConfig,
        dedupe_cfg: DedupeConfig,
    ) -> Self {
        Self {
            planner,
            gateway,
            registry,
            agent_cfg,
            dedupe_cfg,
            max_output_tokens: 1024,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Cooperative cancellation: the flag is checked between steps only —
    /// an in-flight tool call runs to completion.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(&self, ctx: &AskContext) -> Result<LoopOutcome> {
        let tracker = HistoryTracker::new(self.dedupe_cfg.clone());
        self.drive(ctx, tracker, 0)
    }

    /// Resume a suspended turn after a human response.
    ///
    /// Rejection finishes the continuation chain with the history
    /// unchanged. Approval re-executes the same call — with `edited_body`
    /// substituted when provided — bypassing the validation check, then
    /// continues the loop at the saved step.
    pub fn resume(
        &self,
        pending: PendingValidation,
        approved: bool,
        edited_body: Option<Value>,
    ) -> Result<LoopOutcome> {
        let PendingValidation { request, resume } = pending;
        let ctx = AskContext {
            prompt: resume.prompt.clone(),
            model: resume.model.clone(),
            operation_hints: resume.operation_hints.clone(),
            actor_id: resume.actor_id.clone(),
            session_id: resume.session_id,
            message_id: resume.message_id,
            turn_started_at: resume.turn_started_at,
            user_wait_ms: (Utc::now() - request.created_at).num_milliseconds().max(0) as u64,
        };
        let mut tracker = HistoryTracker::from_entries(self.dedupe_cfg.clone(), resume.history);

        if !approved {
            return Ok(LoopOutcome::Finished {
                answer: NOT_APPROVED_ANSWER.to_string(),
                history: tracker.into_entries(),
                steps: resume.next_step,
            });
        }

        let mut args = request.args.clone();
        if let Some(body) = edited_body
            && let Some(obj) = args.as_object_mut()
        {
            obj.insert("body".to_string(), body);
        }

        let executor = ToolExecutor::new(self.gateway);
        match executor.execute(EXECUTE_TOOL, &args, true) {
            ToolOutcome::NeedsValidation(request) => {
                bail!(
                    "operation {} demanded validation again despite approval",
                    request.operation_id
                );
            }
            ToolOutcome::Failure { error, meta } => {
                tracker.record_error(EXECUTE_TOOL, args, &error.to_value(), Some(meta));
            }
            ToolOutcome::Success {
                envelope,
                meta,
                summaries,
                grounding,
            } => {
                tracker.record_result(EXECUTE_TOOL, args, envelope, Some(meta));
                if let Some(summaries) = summaries {
                    tracker.record_summary(EXECUTE_TOOL, &summaries, &grounding);
                }
            }
        }

        self.drive(&ctx, tracker, resume.next_step)
    }

    fn drive(
        &self,
        ctx: &AskContext,
        mut tracker: HistoryTracker,
        start_step: u32,
    ) -> Result<LoopOutcome> {
        let catalog = self.gateway.list_tools().unwrap_or_default();
        let executor = ToolExecutor::new(self.gateway);
        let mut step = start_step;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                bail!("cancelled");
            }
            if step >= self.agent_cfg.max_steps {
                bail!(
                    "could not complete the request within {} steps",
                    self.agent_cfg.max_steps
                );
            }

            let raw = self.planner.plan(&PlanRequest {
                prompt: ctx.prompt.clone(),
                model: ctx.model.clone(),
                tool_catalog: catalog.clone(),
                history: tracker.entries().to_vec(),
                operation_hints: ctx.operation_hints.clone(),
                max_output_tokens: self.max_output_tokens,
            })?;

            match normalize_plan(raw.as_ref()) {
                Plan::FinalAnswer { answer } => {
                    let latest = tracker.latest_payload();
                    let answer = format_final_answer(answer, latest.as_ref());
                    return Ok(LoopOutcome::Finished {
                        answer,
                        history: tracker.into_entries(),
                        steps: step,
                    });
                }
                Plan::CallTool {
                    tool_name,
                    tool_args,
                } => {
                    let args = Value::Object(tool_args);
                    let cacheable = is_cacheable(&tool_name, &args);
                    if let Some(prior) = tracker.cached_success(&tool_name, &args, cacheable) {
                        tracker.record_duplicate(&tool_name, &args, &prior);
                        step += 1;
                        continue;
                    }

                    match executor.execute(&tool_name, &args, false) {
                        ToolOutcome::NeedsValidation(request) => {
                            let request = *request;
                            let resume = ResumeState {
                                prompt: ctx.prompt.clone(),
                                model: ctx.model.clone(),
                                operation_hints: ctx.operation_hints.clone(),
                                actor_id: ctx.actor_id.clone(),
                                session_id: ctx.session_id,
                                message_id: ctx.message_id,
                                history: tracker.entries().to_vec(),
                                next_step: step + 1,
                                turn_started_at: ctx.turn_started_at,
                                user_wait_ms: (Utc::now() - ctx.turn_started_at)
                                    .num_milliseconds()
                                    .max(0) as u64,
                            };
                            self.registry.attach(request.clone(), resume);
                            return Ok(LoopOutcome::Suspended {
                                request,
                                history: tracker.into_entries(),
                            });
                        }
                        ToolOutcome::Failure { error, meta } => {
                            tracker.record_error(&tool_name, args, &error.to_value(), Some(meta));
                            step += 1;
                        }
                        ToolOutcome::Success {
                            envelope,
                            meta,
                            summaries,
                            grounding,
                        } => {
                            tracker.record_result(&tool_name, args, envelope, Some(meta));
                            if let Some(summaries) = summaries {
                                tracker.record_summary(&tool_name, &summaries, &grounding);
                            }
                            step += 1;
                        }
                    }
                }
            }
        }
    }
}

/// Format a final answer as minimally-structured text. Unstructured answers
/// get a "Key figures" section grounded in the numeric fields actually
/// observed in the latest payload.
pub fn format_final_answer(answer: Option<String>, latest_payload: Option<&Value>) -> String {
    let text = answer
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_ANSWER.to_string());
    if has_structure(&text) {
        return text;
    }
    let Some(payload) = latest_payload else {
        return text;
    };
    let figures = ground_truth_numbers(payload);
    if figures.is_empty() {
        return text;
    }
    let mut out = text;
    out.push_str("\n\nKey figures:\n");
    for (path, value) in &figures {
        out.push_str(&format!("- {path}: {value}\n"));
    }
    out.trim_end().to_string()
}

fn has_structure(text: &str) -> bool {
    text.contains('\n') || text.starts_with('#') || text.contains("- ") || text.contains("* ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_answers_pass_through() {
        let answer = "# Result\n- 3 products".to_string();
        assert_eq!(
            format_final_answer(Some(answer.clone()), Some(&json!({"total": 3}))),
            answer
        );
    }

    #[test]
    fn unstructured_answers_get_grounded_figures() {
        let formatted = format_final_answer(
            Some("The order total is 120.".to_string()),
            Some(&json!({"order": {"total": 120, "note": "x"}})),
        );
        assert!(formatted.starts_with("The order total is 120."));
        assert!(formatted.contains("Key figures:"));
        assert!(formatted.contains("- order.total: 120"));
    }

    #[test]
    fn empty_answers_fall_back() {
        assert_eq!(format_final_answer(None, None), FALLBACK_ANSWER);
        assert_eq!(
            format_final_answer(Some("   ".to_string()), None),
            FALLBACK_ANSWER
        );
    }
}
