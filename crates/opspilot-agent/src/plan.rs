//! Plan normalization: map loosely-shaped planner output onto a strict
//! [`Plan`].
//!
//! The planner is an external LLM and its JSON drifts — field names vary,
//! actions come in synonyms, tool names sometimes land in the action slot.
//! This module is a total function over that mess: any input, including
//! `null`, arrays, or objects missing `action`, yields a well-formed plan.
//! Unrecognizable input becomes the fallback final answer so the loop can
//! always make forward progress.

use opspilot_core::{EXECUTE_TOOL, Plan, normalize_ident};
use serde_json::Value;

const ACTION_FIELDS: &[&str] = &["action", "type", "decision", "next_action"];
const TOOL_NAME_FIELDS: &[&str] = &["tool_name", "toolName", "tool", "name"];
const OPERATION_FIELDS: &[&str] = &["operation_id", "operationId", "operation", "op_id"];
const ARGS_FIELDS: &[&str] = &[
    "tool_args",
    "toolArgs",
    "args",
    "arguments",
    "input",
    "params",
    "parameters",
];
const ANSWER_FIELDS: &[&str] = &[
    "answer",
    "final_answer",
    "response",
    "text",
    "message",
    "content",
    "reply",
];

const FINAL_ACTIONS: &[&str] = &[
    "final_answer",
    "final",
    "answer",
    "respond",
    "response",
    "reply",
    "finish",
    "done",
    "complete",
];
const TOOL_ACTIONS: &[&str] = &[
    "call_tool",
    "tool_call",
    "use_tool",
    "tool",
    "invoke_tool",
    "execute_tool",
    "execute",
    "call",
    "run_tool",
];

/// Minimum Jaro-Winkler similarity for a near-miss action name to count as
/// a synonym.
const FUZZY_ACTION_THRESHOLD: f64 = 0.88;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ActionKind {
    Final,
    Tool,
}

pub fn normalize_plan(raw: Option<&Value>) -> Plan {
    let Some(value) = raw else {
        return Plan::fallback();
    };
    let Some(obj) = value.as_object() else {
        return Plan::fallback();
    };

    let action = ACTION_FIELDS
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_str));
    let Some(action) = action else {
        return Plan::fallback();
    };

    // Dotted names ("api.execute") are tool names that landed in the
    // action slot: an implicit tool call.
    if action.contains('.') {
        return call_tool_plan(obj, Some(action.trim().to_string()));
    }

    match classify_action(action) {
        Some(ActionKind::Final) => final_plan(obj),
        Some(ActionKind::Tool) => call_tool_plan(obj, None),
        None => Plan::fallback(),
    }
}

fn classify_action(action: &str) -> Option<ActionKind> {
    let normalized = normalize_ident(action);
    if normalized.is_empty() {
        return None;
    }
    if FINAL_ACTIONS.contains(&normalized.as_str()) {
        return Some(ActionKind::Final);
    }
    if TOOL_ACTIONS.contains(&normalized.as_str()) {
        return Some(ActionKind::Tool);
    }

    // Near-miss spellings ("finall_answer", "tool_calll") still classify.
    let mut best: Option<(ActionKind, f64)> = None;
    for (kind, candidates) in [
        (ActionKind::Final, FINAL_ACTIONS),
        (ActionKind::Tool, TOOL_ACTIONS),
    ] {
        for candidate in candidates {
            let score = strsim::jaro_winkler(&normalized, candidate);
            if score >= FUZZY_ACTION_THRESHOLD
                && best.is_none_or(|(_, prev)| score > prev)
            {
                best = Some((kind, score));
            }
        }
    }
    best.map(|(kind, _)| kind)
}

fn final_plan(obj: &serde_json::Map<String, Value>) -> Plan {
    let answer = ANSWER_FIELDS
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_str))
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());
    Plan::FinalAnswer { answer }
}

fn call_tool_plan(obj: &serde_json::Map<String, Value>, explicit_tool: Option<String>) -> Plan {
    let named_tool = explicit_tool.or_else(|| {
        TOOL_NAME_FIELDS
            .iter()
            .find_map(|field| obj.get(*field).and_then(Value::as_str))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    });
    let operation_id = OPERATION_FIELDS
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_str))
        .map(|op| op.trim().to_string())
        .filter(|op| !op.is_empty());

    // An operation-id-shaped field without an explicit tool name implies
    // the generic operation executor.
    let tool_name = match named_tool {
        Some(name) => name,
        None if operation_id.is_some() => EXECUTE_TOOL.to_string(),
        None => return Plan::fallback(),
    };

    let mut tool_args = ARGS_FIELDS
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_object))
        .cloned()
        .unwrap_or_default();

    if tool_name == EXECUTE_TOOL && !tool_args.contains_key("operation_id") {
        let from_args = tool_args
            .remove("operationId")
            .and_then(|v| v.as_str().map(|s| s.to_string()));
        if let Some(op) = from_args.or(operation_id) {
            tool_args.insert("operation_id".to_string(), Value::String(op));
        }
    }

    Plan::CallTool {
        tool_name,
        tool_args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opspilot_core::FALLBACK_ANSWER;
    use serde_json::json;

    fn fallback() -> Plan {
        Plan::FinalAnswer {
            answer: Some(FALLBACK_ANSWER.to_string()),
        }
    }

    #[test]
    fn null_and_non_object_inputs_fall_back() {
        assert_eq!(normalize_plan(None), fallback());
        assert_eq!(normalize_plan(Some(&Value::Null)), fallback());
        assert_eq!(normalize_plan(Some(&json!([1, 2, 3]))), fallback());
        assert_eq!(normalize_plan(Some(&json!("just a string"))), fallback());
        assert_eq!(normalize_plan(Some(&json!({"note": "no action"}))), fallback());
    }

    #[test]
    fn final_answer_synonyms_and_fields_are_coerced() {
        for action in ["final_answer", "respond", "Answer", "REPLY", "done"] {
            let plan = normalize_plan(Some(&json!({"action": action, "response": "42 items"})));
            assert_eq!(
                plan,
                Plan::FinalAnswer {
                    answer: Some("42 items".to_string())
                },
                "action {action}"
            );
        }
        let plan = normalize_plan(Some(&json!({"action": "final_answer"})));
        assert_eq!(plan, Plan::FinalAnswer { answer: None });
    }

    #[test]
    fn near_miss_action_spellings_classify() {
        let plan = normalize_plan(Some(&json!({"action": "finall_answer", "answer": "ok"})));
        assert_eq!(
            plan,
            Plan::FinalAnswer {
                answer: Some("ok".to_string())
            }
        );
        let plan = normalize_plan(Some(
            &json!({"action": "tool_calll", "tool": "api.execute", "args": {"operation_id": "list_products"}}),
        ));
        assert!(matches!(plan, Plan::CallTool { .. }));
    }

    #[test]
    fn dotted_action_is_an_implicit_tool_call() {
        let plan = normalize_plan(Some(
            &json!({"action": "api.execute", "args": {"operation_id": "list_products"}}),
        ));
        let Plan::CallTool {
            tool_name,
            tool_args,
        } = plan
        else {
            panic!("expected tool call");
        };
        assert_eq!(tool_name, "api.execute");
        assert_eq!(tool_args["operation_id"], "list_products");
    }

    #[test]
    fn operation_id_field_implies_the_executor_tool() {
        let plan = normalize_plan(Some(
            &json!({"action": "call_tool", "operationId": "createProduct", "arguments": {"body": {"title": "Mug"}}}),
        ));
        let Plan::CallTool {
            tool_name,
            tool_args,
        } = plan
        else {
            panic!("expected tool call");
        };
        assert_eq!(tool_name, EXECUTE_TOOL);
        assert_eq!(tool_args["operation_id"], "createProduct");
        assert_eq!(tool_args["body"]["title"], "Mug");
    }

    #[test]
    fn camel_case_operation_id_inside_args_is_renamed() {
        let plan = normalize_plan(Some(
            &json!({"action": "use_tool", "tool": EXECUTE_TOOL, "args": {"operationId": "deleteProduct"}}),
        ));
        let Plan::CallTool { tool_args, .. } = plan else {
            panic!("expected tool call");
        };
        assert_eq!(tool_args["operation_id"], "deleteProduct");
        assert!(!tool_args.contains_key("operationId"));
    }

    #[test]
    fn tool_action_without_any_tool_name_falls_back() {
        let plan = normalize_plan(Some(&json!({"action": "call_tool", "args": {"x": 1}})));
        assert_eq!(plan, fallback());
    }

    #[test]
    fn unrecognized_action_falls_back() {
        let plan = normalize_plan(Some(&json!({"action": "meditate"})));
        assert_eq!(plan, fallback());
    }
}
