//! Suspend/resume correctness for destructive operations.

use opspilot_agent::ask_loop::{AskContext, AskLoop, LoopOutcome};
use opspilot_agent::executor::{ToolExecutor, ToolOutcome};
use opspilot_agent::validation::ValidationRegistry;
use opspilot_core::{
    AgentLoopConfig, DedupeConfig, EXECUTE_TOOL, NOT_APPROVED_ANSWER, SCHEMA_TOOL, ToolEnvelope,
};
use opspilot_testkit::{RecordingGateway, ScriptedPlanner};
use serde_json::json;
use uuid::Uuid;

fn destructive_plan() -> serde_json::Value {
    json!({
        "action": "call_tool",
        "tool": EXECUTE_TOOL,
        "args": {
            "operation_id": "create_product",
            "body": {"title": "Mug", "status": "draft"}
        }
    })
}

#[test]
fn destructive_calls_suspend_without_touching_the_gateway() {
    let planner = ScriptedPlanner::new(vec![destructive_plan()]);
    let gateway = RecordingGateway::new();
    let registry = ValidationRegistry::new();
    let ask_loop = AskLoop::new(
        &planner,
        &gateway,
        &registry,
        AgentLoopConfig::default(),
        DedupeConfig::default(),
    );

    let outcome = ask_loop
        .run(&AskContext::new("create a mug product", Uuid::now_v7()))
        .expect("loop outcome");
    let LoopOutcome::Suspended { request, .. } = outcome else {
        panic!("expected suspension");
    };

    assert_eq!(request.operation_id, "create_product");
    assert_eq!(gateway.executions_of("create_product").len(), 0);
    assert_eq!(gateway.calls_for(SCHEMA_TOOL), 1);
    assert!(registry.get(request.id).is_some());
}

#[test]
fn approval_executes_exactly_once_with_the_edited_body() {
    let planner = ScriptedPlanner::new(vec![
        destructive_plan(),
        json!({"action": "final_answer", "answer": "Product created."}),
    ]);
    let gateway = RecordingGateway::new();
    let registry = ValidationRegistry::new();
    let ask_loop = AskLoop::new(
        &planner,
        &gateway,
        &registry,
        AgentLoopConfig::default(),
        DedupeConfig::default(),
    );

    let outcome = ask_loop
        .run(&AskContext::new("create a mug product", Uuid::now_v7()))
        .expect("loop outcome");
    let LoopOutcome::Suspended { request, .. } = outcome else {
        panic!("expected suspension");
    };

    let pending = registry.take(request.id).expect("pending validation");
    let edited = json!({"title": "Mug (large)", "status": "published"});
    let outcome = ask_loop
        .resume(pending, true, Some(edited))
        .expect("resumed outcome");

    let LoopOutcome::Finished { answer, .. } = outcome else {
        panic!("expected a finished turn");
    };
    assert_eq!(answer, "Product created.");

    let executions = gateway.executions_of("create_product");
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["body"]["title"], "Mug (large)");
    assert_eq!(executions[0]["body"]["status"], "published");
}

#[test]
fn rejection_executes_nothing_and_keeps_history_unchanged() {
    let planner = ScriptedPlanner::new(vec![destructive_plan()]);
    let gateway = RecordingGateway::new();
    let registry = ValidationRegistry::new();
    let ask_loop = AskLoop::new(
        &planner,
        &gateway,
        &registry,
        AgentLoopConfig::default(),
        DedupeConfig::default(),
    );

    let outcome = ask_loop
        .run(&AskContext::new("create a mug product", Uuid::now_v7()))
        .expect("loop outcome");
    let LoopOutcome::Suspended { request, history } = outcome else {
        panic!("expected suspension");
    };

    let pending = registry.take(request.id).expect("pending validation");
    let outcome = ask_loop.resume(pending, false, None).expect("resumed");

    let LoopOutcome::Finished {
        answer,
        history: resumed_history,
        ..
    } = outcome
    else {
        panic!("expected a finished turn");
    };
    assert_eq!(answer, NOT_APPROVED_ANSWER);
    assert_eq!(resumed_history, history);
    assert_eq!(gateway.executions_of("create_product").len(), 0);
}

#[test]
fn chained_destructive_calls_suspend_again_after_approval() {
    let planner = ScriptedPlanner::new(vec![
        destructive_plan(),
        json!({
            "action": "call_tool",
            "tool": EXECUTE_TOOL,
            "args": {
                "operation_id": "delete_product",
                "path_params": {"id": "prod_old"},
                "body": {}
            }
        }),
    ]);
    let gateway = RecordingGateway::new();
    let registry = ValidationRegistry::new();
    let ask_loop = AskLoop::new(
        &planner,
        &gateway,
        &registry,
        AgentLoopConfig::default(),
        DedupeConfig::default(),
    );

    let outcome = ask_loop
        .run(&AskContext::new("replace the mug product", Uuid::now_v7()))
        .expect("loop outcome");
    let LoopOutcome::Suspended { request: first, .. } = outcome else {
        panic!("expected first suspension");
    };

    let pending = registry.take(first.id).expect("first pending");
    let outcome = ask_loop.resume(pending, true, None).expect("resumed");
    let LoopOutcome::Suspended { request: second, .. } = outcome else {
        panic!("expected second suspension");
    };

    assert_eq!(second.operation_id, "delete_product");
    assert_ne!(first.id, second.id);
    assert!(registry.get(second.id).is_some());
    assert_eq!(gateway.executions_of("create_product").len(), 1);
    assert_eq!(gateway.executions_of("delete_product").len(), 0);
}

#[test]
fn validation_requests_carry_schema_context_and_previews() {
    let gateway = RecordingGateway::new();
    gateway.respond_with(
        SCHEMA_TOOL,
        ToolEnvelope::from_text(
            r#"{"method":"POST","path":"/admin/products/{id}","body_field_enums":{"status":["draft","published"]},"body_field_read_only":["id"]}"#,
        ),
    );
    gateway.respond_with(
        EXECUTE_TOOL,
        ToolEnvelope::from_text(
            r#"{"product":{"id":"prod_1","title":"Mug","status":"draft","weight":350}}"#,
        ),
    );

    let executor = ToolExecutor::new(&gateway);
    let args = json!({
        "operation_id": "update_product",
        "path_params": {"id": "prod_1"},
        "body": {"status": "published"}
    });
    let outcome = executor.execute(EXECUTE_TOOL, &args, false);
    let ToolOutcome::NeedsValidation(request) = outcome else {
        panic!("expected validation");
    };

    assert_eq!(request.method.as_deref(), Some("POST"));
    assert_eq!(
        request.body_field_read_only.as_deref(),
        Some(&["id".to_string()][..])
    );
    let preview = request.resource_preview.as_ref().expect("preview");
    assert_eq!(preview["id"], "prod_1");
    assert_eq!(preview["title"], "Mug");

    // The preview was fetched through the paired read operation.
    assert_eq!(gateway.executions_of("get_product").len(), 1);
    assert_eq!(gateway.executions_of("update_product").len(), 0);
}

#[test]
fn schema_fetch_failure_is_tolerated() {
    let gateway = RecordingGateway::new();
    gateway.respond_with(SCHEMA_TOOL, ToolEnvelope::error_text("schema service down"));

    let executor = ToolExecutor::new(&gateway);
    let args = json!({"operation_id": "delete_product", "body": {}});
    let outcome = executor.execute(EXECUTE_TOOL, &args, false);
    let ToolOutcome::NeedsValidation(request) = outcome else {
        panic!("expected validation");
    };
    assert!(request.body_field_enums.is_none());
    assert!(request.method.is_none());
    assert!(request.resource_preview.is_none());
}
