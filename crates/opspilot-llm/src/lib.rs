//! Blocking HTTP client for the external planning LLM.
//!
//! The planner speaks an OpenAI-style chat-completions wire format. A thrown
//! error here is loop-fatal for the ask loop; an empty or non-JSON response
//! is not — it normalizes to the fallback final answer upstream.

use anyhow::{Result, anyhow};
use opspilot_core::{HistoryEntry, LlmConfig, ToolDescriptor};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;

/// Upper bound on payload characters quoted per history entry in the
/// planner prompt.
const HISTORY_SNIPPET_CHARS: usize = 240;

/// History entries older than this are elided from the planner prompt.
const HISTORY_WINDOW: usize = 20;

/// One planning request: everything the external LLM needs to pick the
/// next action for a turn.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub prompt: String,
    pub model: String,
    pub tool_catalog: Vec<ToolDescriptor>,
    pub history: Vec<HistoryEntry>,
    pub operation_hints: Vec<String>,
    pub max_output_tokens: u32,
}

pub trait PlannerClient: Send + Sync {
    /// Ask for the next decision. `Ok(None)` means the model produced no
    /// parseable JSON — the caller normalizes that to a fallback answer.
    fn plan(&self, req: &PlanRequest) -> Result<Option<Value>>;

    /// One-shot strict-JSON completion, used by the feedback generator.
    fn complete_json(&self, system: &str, user: &str) -> Result<Option<Value>>;
}

#[derive(Debug, Clone)]
pub struct HttpPlanner {
    cfg: LlmConfig,
    client: Client,
}

impl HttpPlanner {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn api_key(&self) -> Result<String> {
        std::env::var(&self.cfg.api_key_env)
            .map_err(|_| anyhow!("missing API key: set {}", self.cfg.api_key_env))
    }

    fn post_chat(&self, payload: &Value) -> Result<String> {
        let api_key = self.api_key()?;
        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(&api_key)
                .json(payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return Ok(body);
                    }
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        attempt,
                        self.cfg.max_retries,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(err) => {
                    last_err = Some(anyhow!("planner request failed: {err}"));
                    if attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("planner request failed")))
    }

    fn chat_payload(&self, model: &str, system: &str, user: &str, max_tokens: u32) -> Value {
        json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": max_tokens,
            "response_format": {"type": "json_object"},
        })
    }
}

impl PlannerClient for HttpPlanner {
    fn plan(&self, req: &PlanRequest) -> Result<Option<Value>> {
        let model = if req.model.is_empty() {
            self.cfg.model.clone()
        } else {
            req.model.clone()
        };
        let system = planner_system_prompt(&req.tool_catalog, &req.operation_hints);
        let user = planner_user_prompt(&req.prompt, &req.history);
        let body = self.post_chat(&self.chat_payload(
            &model,
            &system,
            &user,
            req.max_output_tokens.max(1),
        ))?;
        Ok(parse_chat_content(&body))
    }

    fn complete_json(&self, system: &str, user: &str) -> Result<Option<Value>> {
        let body = self.post_chat(&self.chat_payload(
            &self.cfg.model,
            system,
            user,
            self.cfg.max_output_tokens,
        ))?;
        Ok(parse_chat_content(&body))
    }
}

/// Parse the assistant message out of a chat-completions body and return
/// the JSON object it carries, if any.
fn parse_chat_content(body: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let content = parsed
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?;
    let snippet = extract_json_snippet(content)?;
    serde_json::from_str(snippet).ok()
}

/// Pull a JSON object out of model output that may be fenced or surrounded
/// by prose.
pub fn extract_json_snippet(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    if let Some(start) = text.find('{')
        && let Some(end) = text.rfind('}')
        && end > start
    {
        return Some(text[start..=end].trim());
    }
    None
}

fn planner_system_prompt(catalog: &[ToolDescriptor], hints: &[String]) -> String {
    let mut prompt = String::from(
        "You are an operations agent planner. Decide the single next action.\n\
         Respond with one JSON object, either\n\
         {\"action\":\"call_tool\",\"tool_name\":...,\"tool_args\":{...}} or\n\
         {\"action\":\"final_answer\",\"answer\":...}.\n\nAvailable tools:\n",
    );
    for tool in catalog {
        prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }
    if !hints.is_empty() {
        prompt.push_str("\nLikely relevant operations:\n");
        for hint in hints {
            prompt.push_str(&format!("- {hint}\n"));
        }
    }
    prompt
}

fn planner_user_prompt(prompt: &str, history: &[HistoryEntry]) -> String {
    let mut out = format!("Request: {prompt}\n");
    if history.is_empty() {
        return out;
    }
    out.push_str("\nActions taken so far (oldest first):\n");
    let skipped = history.len().saturating_sub(HISTORY_WINDOW);
    if skipped > 0 {
        out.push_str(&format!("({skipped} earlier entries elided)\n"));
    }
    for entry in history.iter().skip(skipped) {
        let mut snippet = entry
            .payload()
            .map(|p| p.to_string())
            .unwrap_or_else(|| entry.tool_result.joined_text());
        if snippet.len() > HISTORY_SNIPPET_CHARS {
            snippet.truncate(HISTORY_SNIPPET_CHARS);
            snippet.push('…');
        }
        let marker = if entry.tool_result.is_error { "error" } else { "ok" };
        out.push_str(&format!("- {} [{}]: {}\n", entry.tool_name, marker, snippet));
    }
    out
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_delay(base_ms: u64, attempt: u8, retry_after: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after {
        return Duration::from_secs(seconds);
    }
    Duration::from_millis(base_ms.saturating_mul(1 << attempt.min(6)))
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    header?.to_str().ok()?.trim().parse().ok()
}

fn format_api_error(
    status: StatusCode,
    body: &str,
    attempt: u8,
    max_retries: u8,
) -> anyhow::Error {
    let detail: String = body.chars().take(300).collect();
    anyhow!(
        "planner API error {status} (attempt {}/{}): {detail}",
        attempt + 1,
        max_retries + 1
    )
}
