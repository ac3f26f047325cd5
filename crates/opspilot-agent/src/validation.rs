//! Pending human-approval registry.
//!
//! Process-wide shared state: a validation request outlives the turn that
//! created it, until a human responds or the TTL sweep collects it. The
//! registry is an explicit store passed by injection — multiple independent
//! loop instances can each own one — and the continuation is a plain
//! serializable [`ResumeState`], not a closure.

use chrono::{DateTime, Utc};
use opspilot_core::{HistoryEntry, ValidationRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Everything needed to resume a suspended turn: the loop re-enters at
/// `next_step` with the snapshotted history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub prompt: String,
    pub model: String,
    pub operation_hints: Vec<String>,
    pub actor_id: Option<String>,
    pub session_id: Uuid,
    pub message_id: Uuid,
    pub history: Vec<HistoryEntry>,
    pub next_step: u32,
    pub turn_started_at: DateTime<Utc>,
    pub user_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingValidation {
    pub request: ValidationRequest,
    pub resume: ResumeState,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// 404-equivalent: resolving an unknown or already-resolved id is a
    /// reported error, not a crash.
    #[error("validation request {0} not found or expired")]
    NotFound(Uuid),
}

#[derive(Default)]
pub struct ValidationRegistry {
    inner: Mutex<HashMap<Uuid, PendingValidation>>,
}

impl ValidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<Uuid, PendingValidation>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind an unresolved request to its resumable continuation and turn
    /// context. Chained approvals re-attach under the new request id.
    pub fn attach(&self, request: ValidationRequest, resume: ResumeState) {
        let id = request.id;
        self.guard().insert(id, PendingValidation { request, resume });
    }

    pub fn get(&self, id: Uuid) -> Option<PendingValidation> {
        self.guard().get(&id).cloned()
    }

    /// Remove and return a pending validation; resolving terminates its
    /// registry lifetime.
    pub fn take(&self, id: Uuid) -> Result<PendingValidation, ValidationError> {
        self.guard().remove(&id).ok_or(ValidationError::NotFound(id))
    }

    pub fn pending_requests(&self) -> Vec<ValidationRequest> {
        let mut requests: Vec<ValidationRequest> = self
            .guard()
            .values()
            .map(|pending| pending.request.clone())
            .collect();
        requests.sort_by_key(|request| request.created_at);
        requests
    }

    /// Drop requests older than `ttl`; returns how many were collected.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut guard = self.guard();
        let before = guard.len();
        guard.retain(|_, pending| pending.request.created_at > cutoff);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request(created_at: DateTime<Utc>) -> ValidationRequest {
        ValidationRequest {
            id: Uuid::now_v7(),
            operation_id: "delete_product".to_string(),
            method: Some("DELETE".to_string()),
            path: Some("/admin/products/{id}".to_string()),
            args: json!({"operation_id": "delete_product", "path_params": {"id": "prod_1"}}),
            body_field_enums: None,
            body_field_read_only: None,
            resource_preview: None,
            created_at,
        }
    }

    fn sample_resume() -> ResumeState {
        ResumeState {
            prompt: "delete the mug product".to_string(),
            model: "test".to_string(),
            operation_hints: vec![],
            actor_id: None,
            session_id: Uuid::now_v7(),
            message_id: Uuid::now_v7(),
            history: vec![],
            next_step: 1,
            turn_started_at: Utc::now(),
            user_wait_ms: 0,
        }
    }

    #[test]
    fn attach_get_take_round_trip() {
        let registry = ValidationRegistry::new();
        let request = sample_request(Utc::now());
        let id = request.id;
        registry.attach(request, sample_resume());

        assert!(registry.get(id).is_some());
        let taken = registry.take(id).expect("take");
        assert_eq!(taken.request.operation_id, "delete_product");
        assert!(matches!(
            registry.take(id),
            Err(ValidationError::NotFound(_))
        ));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let registry = ValidationRegistry::new();
        assert!(matches!(
            registry.take(Uuid::now_v7()),
            Err(ValidationError::NotFound(_))
        ));
    }

    #[test]
    fn sweep_collects_only_expired_requests() {
        let registry = ValidationRegistry::new();
        let stale = sample_request(Utc::now() - chrono::Duration::hours(2));
        let fresh = sample_request(Utc::now());
        let fresh_id = fresh.id;
        registry.attach(stale, sample_resume());
        registry.attach(fresh, sample_resume());

        let collected = registry.sweep_expired(Duration::from_secs(3600));
        assert_eq!(collected, 1);
        assert!(registry.get(fresh_id).is_some());
        assert_eq!(registry.len(), 1);
    }
}
