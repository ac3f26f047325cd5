//! Test doubles for the ask loop: a scripted planner, a recording gateway,
//! and a temp workspace helper.

use anyhow::Result;
use opspilot_core::{ToolDescriptor, ToolEnvelope};
use opspilot_gateway::Gateway;
use opspilot_llm::{PlanRequest, PlannerClient};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Planner stub that replays a script of canned decisions.
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Value>>,
    repeated: Option<Value>,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<Value>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
            repeated: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A planner that returns the same decision forever — step-budget
    /// tests want a planner that never finishes.
    pub fn repeating(plan: Value) -> Self {
        Self {
            plans: Mutex::new(VecDeque::new()),
            repeated: Some(plan),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PlannerClient for ScriptedPlanner {
    fn plan(&self, _req: &PlanRequest) -> Result<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut plans) = self.plans.lock()
            && let Some(next) = plans.pop_front()
        {
            return Ok(Some(next));
        }
        Ok(self.repeated.clone())
    }

    fn complete_json(&self, _system: &str, _user: &str) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Gateway stub that records every call and replays scripted envelopes,
/// falling back to a generic 200 payload.
pub struct RecordingGateway {
    calls: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, VecDeque<ToolEnvelope>>>,
    tools: Vec<ToolDescriptor>,
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            tools: vec![
                ToolDescriptor {
                    name: opspilot_core::EXECUTE_TOOL.to_string(),
                    description: "execute a backend API operation".to_string(),
                    input_schema: None,
                },
                ToolDescriptor {
                    name: opspilot_core::SCHEMA_TOOL.to_string(),
                    description: "look up schema metadata for an operation".to_string(),
                    input_schema: None,
                },
            ],
        }
    }

    /// Queue a scripted envelope for the next call to `tool`.
    pub fn respond_with(&self, tool: &str, envelope: ToolEnvelope) {
        if let Ok(mut responses) = self.responses.lock() {
            responses
                .entry(tool.to_string())
                .or_default()
                .push_back(envelope);
        }
    }

    pub fn recorded_calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn calls_for(&self, tool: &str) -> usize {
        self.recorded_calls()
            .iter()
            .filter(|(name, _)| name == tool)
            .count()
    }

    /// Calls to the executor tool for one operation id.
    pub fn executions_of(&self, operation_id: &str) -> Vec<Value> {
        self.recorded_calls()
            .into_iter()
            .filter(|(name, args)| {
                name == opspilot_core::EXECUTE_TOOL
                    && args.get("operation_id").and_then(Value::as_str) == Some(operation_id)
            })
            .map(|(_, args)| args)
            .collect()
    }
}

impl Gateway for RecordingGateway {
    fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    fn call_tool(&self, name: &str, args: &Value) -> Result<ToolEnvelope> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((name.to_string(), args.clone()));
        }
        if let Ok(mut responses) = self.responses.lock()
            && let Some(queue) = responses.get_mut(name)
            && let Some(envelope) = queue.pop_front()
        {
            return Ok(envelope);
        }
        Ok(ToolEnvelope::from_json(&json!({"status": 200, "ok": true})))
    }
}

/// Fresh scratch workspace; dropped with the returned guard.
pub fn temp_workspace() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp workspace")
}
