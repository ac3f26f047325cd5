//! Engine wiring: configuration, persistence, observation, the validation
//! registry, and the public `ask` / `respond_to_validation` entry points.
//!
//! One engine serves many turns. Per-turn state lives inside the ask loop;
//! the registry and the ANPS dedupe sets are the only process-wide shared
//! state, both injected here so independent engines stay isolated.

use crate::anps::{AnpsSubmitter, evaluate_turn};
use crate::ask_loop::{AskContext, AskLoop, LoopOutcome};
use crate::validation::ValidationRegistry;
use anyhow::Result;
use chrono::Utc;
use opspilot_core::{AppConfig, EventEnvelope, EventKind, ValidationRequest};
use opspilot_gateway::{Gateway, GatewayManager, HttpGateway};
use opspilot_llm::{HttpPlanner, PlannerClient};
use opspilot_observe::Observer;
use opspilot_store::{SessionRecord, Store};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Public outcome of one `ask` or `respond_to_validation` call.
#[derive(Debug)]
pub enum AskOutcome {
    Answer {
        session_id: Uuid,
        answer: String,
        steps: u32,
    },
    AwaitingApproval {
        session_id: Uuid,
        request: ValidationRequest,
    },
}

pub struct AgentEngine {
    cfg: AppConfig,
    store: Arc<Store>,
    observer: Arc<Observer>,
    registry: Arc<ValidationRegistry>,
    planner: Arc<dyn PlannerClient>,
    gateway: Arc<dyn Gateway>,
    submitter: Arc<AnpsSubmitter>,
    cancel: Arc<AtomicBool>,
    seq: AtomicU64,
}

impl AgentEngine {
    pub fn new(workspace: &Path) -> Result<Self> {
        let cfg = AppConfig::ensure(workspace)?;
        let planner: Arc<dyn PlannerClient> = Arc::new(HttpPlanner::new(cfg.llm.clone())?);
        let server = GatewayManager::new(workspace).primary()?;
        let gateway: Arc<dyn Gateway> = Arc::new(HttpGateway::from_server(&server)?);
        Self::with_parts(workspace, cfg, planner, gateway)
    }

    /// Construct with injected planner/gateway — the seam used by tests
    /// and by hosts that bring their own transports.
    pub fn with_parts(
        workspace: &Path,
        cfg: AppConfig,
        planner: Arc<dyn PlannerClient>,
        gateway: Arc<dyn Gateway>,
    ) -> Result<Self> {
        let store = Arc::new(Store::new(workspace)?);
        let observer = Arc::new(Observer::new(workspace, &cfg.telemetry)?);
        let submitter = Arc::new(AnpsSubmitter::new(
            gateway.clone(),
            Some(planner.clone()),
            observer.clone(),
            Some(store.clone()),
            cfg.scoring.clone(),
        ));
        Ok(Self {
            cfg,
            store,
            observer,
            registry: Arc::new(ValidationRegistry::new()),
            planner,
            gateway,
            submitter,
            cancel: Arc::new(AtomicBool::new(false)),
            seq: AtomicU64::new(0),
        })
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pending_validations(&self) -> Vec<ValidationRequest> {
        self.registry.pending_requests()
    }

    /// Drop pending validations older than the configured TTL.
    pub fn sweep_validations(&self) -> usize {
        self.registry
            .sweep_expired(Duration::from_secs(self.cfg.agent.validation_ttl_seconds))
    }

    pub fn ask(&self, prompt: &str) -> Result<AskOutcome> {
        self.ask_with_hints(prompt, Vec::new())
    }

    pub fn ask_with_hints(&self, prompt: &str, operation_hints: Vec<String>) -> Result<AskOutcome> {
        let session_id = Uuid::now_v7();
        let mut ctx = AskContext::new(prompt, session_id);
        ctx.model = self.cfg.llm.model.clone();
        ctx.operation_hints = operation_hints;

        self.emit(
            session_id,
            EventKind::TurnStartedV1 {
                prompt: prompt.to_string(),
            },
        );
        self.save_session(session_id, prompt, None, "running")?;

        let outcome = match self.build_loop().run(&ctx) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.emit(
                    session_id,
                    EventKind::LoopFailedV1 {
                        reason: err.to_string(),
                    },
                );
                self.save_session(session_id, prompt, None, "failed")?;
                return Err(err);
            }
        };
        self.finish_turn(session_id, prompt, outcome)
    }

    /// Resolve a pending validation request. Unknown or expired ids are a
    /// reported error, not a crash.
    pub fn respond_to_validation(
        &self,
        id: Uuid,
        approved: bool,
        edited_body: Option<Value>,
    ) -> Result<AskOutcome> {
        self.sweep_validations();
        let pending = self.registry.take(id)?;
        let session_id = pending.resume.session_id;
        let prompt = pending.resume.prompt.clone();
        self.emit(
            session_id,
            EventKind::ValidationResolvedV1 {
                request_id: id,
                approved,
            },
        );

        let outcome = self.build_loop().resume(pending, approved, edited_body)?;
        self.finish_turn(session_id, &prompt, outcome)
    }

    fn build_loop(&self) -> AskLoop<'_> {
        AskLoop::new(
            self.planner.as_ref(),
            self.gateway.as_ref(),
            self.registry.as_ref(),
            self.cfg.agent.clone(),
            self.cfg.dedupe.clone(),
        )
        .with_max_output_tokens(self.cfg.llm.max_output_tokens)
        .with_cancel(self.cancel.clone())
    }

    fn finish_turn(
        &self,
        session_id: Uuid,
        prompt: &str,
        outcome: LoopOutcome,
    ) -> Result<AskOutcome> {
        match outcome {
            LoopOutcome::Finished {
                answer,
                history,
                steps,
            } => {
                self.store.replace_history(session_id, &history)?;
                self.save_session(session_id, prompt, Some(&answer), "answered")?;
                self.emit(session_id, EventKind::LoopFinishedV1 { steps });

                // Scoring is detached: scheduled after the answer exists,
                // and its failures never reach the caller.
                if self.cfg.scoring.enabled {
                    for evaluation in evaluate_turn(&history, &self.cfg.scoring) {
                        self.emit(
                            session_id,
                            EventKind::AnpsScoredV1 {
                                operation_id: evaluation.operation_id.clone(),
                                score: evaluation.score,
                            },
                        );
                        self.submitter
                            .schedule(session_id, evaluation, history.clone());
                    }
                }

                Ok(AskOutcome::Answer {
                    session_id,
                    answer,
                    steps,
                })
            }
            LoopOutcome::Suspended { request, history } => {
                self.store.replace_history(session_id, &history)?;
                self.save_session(session_id, prompt, None, "awaiting_approval")?;
                self.emit(
                    session_id,
                    EventKind::ValidationRequestedV1 {
                        request_id: request.id,
                        operation_id: request.operation_id.clone(),
                    },
                );
                Ok(AskOutcome::AwaitingApproval {
                    session_id,
                    request,
                })
            }
        }
    }

    fn save_session(
        &self,
        session_id: Uuid,
        prompt: &str,
        answer: Option<&str>,
        status: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.store.upsert_session(&SessionRecord {
            session_id,
            prompt: prompt.to_string(),
            answer: answer.map(|s| s.to_string()),
            status: status.to_string(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    fn emit(&self, session_id: Uuid, kind: EventKind) {
        let envelope = EventEnvelope {
            seq_no: self.seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            session_id,
            kind,
        };
        if let Err(err) = self.observer.record_event(&envelope) {
            self.observer.verbose_log(&format!("event log failed: {err}"));
        }
    }
}
