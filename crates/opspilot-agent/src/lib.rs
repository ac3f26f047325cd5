//! Orchestration engine: the step-bounded plan/execute loop and everything
//! it leans on — plan normalization, duplicate-call suppression, the
//! pause/resume validation continuation, payload summarization, and the
//! post-hoc ANPS quality-scoring pipeline.

pub mod anps;
pub mod ask_loop;
pub mod dedupe;
pub mod engine;
pub mod executor;
pub mod feedback;
pub mod history;
pub mod plan;
pub mod summarize;
pub mod validation;

pub use anps::{evaluate_turn, AnpsSubmitter, TURN_SUMMARY_OPERATION};
pub use ask_loop::{AskContext, AskLoop, LoopOutcome, format_final_answer};
pub use dedupe::ToolDedupeCache;
pub use engine::{AgentEngine, AskOutcome};
pub use executor::{ExecutionError, ToolExecutor, ToolOutcome};
pub use feedback::{FeedbackResponse, generate_feedback, status_digest};
pub use history::{HistoryTracker, is_cacheable};
pub use plan::normalize_plan;
pub use summarize::{ground_truth_numbers, summarize_payload};
pub use validation::{PendingValidation, ResumeState, ValidationError, ValidationRegistry};
