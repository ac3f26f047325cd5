//! Engine-level wiring: persistence, validation responses, error surface.

use opspilot_agent::engine::{AgentEngine, AskOutcome};
use opspilot_core::{AppConfig, EXECUTE_TOOL};
use opspilot_testkit::{RecordingGateway, ScriptedPlanner, temp_workspace};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn engine_with(planner: ScriptedPlanner, gateway: RecordingGateway) -> (AgentEngine, tempfile::TempDir) {
    let workspace = temp_workspace();
    let mut cfg = AppConfig::default();
    // Keep background scoring out of these wiring tests.
    cfg.scoring.enabled = false;
    let engine = AgentEngine::with_parts(
        workspace.path(),
        cfg,
        Arc::new(planner),
        Arc::new(gateway),
    )
    .expect("engine");
    (engine, workspace)
}

#[test]
fn a_finished_turn_is_persisted_with_its_answer() {
    let planner = ScriptedPlanner::new(vec![
        json!({
            "action": "call_tool",
            "tool": EXECUTE_TOOL,
            "args": {"operation_id": "list_products"}
        }),
        json!({"action": "final_answer", "answer": "There are 3 products.\n- all active"}),
    ]);
    let (engine, _workspace) = engine_with(planner, RecordingGateway::new());

    let outcome = engine.ask("how many products?").expect("outcome");
    let AskOutcome::Answer {
        session_id, answer, ..
    } = outcome
    else {
        panic!("expected an answer");
    };
    assert!(answer.contains("3 products"));

    let session = engine
        .store()
        .load_session(session_id)
        .expect("load")
        .expect("stored");
    assert_eq!(session.status, "answered");
    let history = engine.store().load_history(session_id).expect("history");
    assert!(!history.is_empty());
}

#[test]
fn suspended_turns_resolve_through_the_engine() {
    let planner = ScriptedPlanner::new(vec![
        json!({
            "action": "call_tool",
            "tool": EXECUTE_TOOL,
            "args": {"operation_id": "create_product", "body": {"title": "Mug"}}
        }),
        json!({"action": "final_answer", "answer": "Created."}),
    ]);
    let (engine, _workspace) = engine_with(planner, RecordingGateway::new());

    let outcome = engine.ask("create a mug").expect("outcome");
    let AskOutcome::AwaitingApproval {
        session_id,
        request,
    } = outcome
    else {
        panic!("expected approval request");
    };
    assert_eq!(engine.pending_validations().len(), 1);

    let session = engine
        .store()
        .load_session(session_id)
        .expect("load")
        .expect("stored");
    assert_eq!(session.status, "awaiting_approval");

    let outcome = engine
        .respond_to_validation(request.id, true, None)
        .expect("resolved");
    let AskOutcome::Answer { answer, .. } = outcome else {
        panic!("expected an answer after approval");
    };
    assert_eq!(answer, "Created.");
    assert!(engine.pending_validations().is_empty());
}

#[test]
fn unknown_validation_ids_report_not_found() {
    let planner = ScriptedPlanner::new(vec![]);
    let (engine, _workspace) = engine_with(planner, RecordingGateway::new());

    let err = engine
        .respond_to_validation(Uuid::now_v7(), true, None)
        .expect_err("missing request");
    assert!(err.to_string().contains("not found or expired"));
}
