use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ValidationError;

use super::retry::RetryPolicy;
use super::snapshot::{PolicyDraft, PolicySet, DEFAULT_MITIGATION_BAND};
use super::store::{PolicyStore, StoreError};

/// Errors from the staging gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("policy promotion is disabled (no approval token configured)")]
    Disabled,

    #[error("approval token rejected")]
    Unauthorized,

    #[error("no staged policy with id {0}")]
    UnknownStaged(u64),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Capability presented by the external approval step.
#[derive(Debug, Clone)]
pub struct ApprovalToken(String);

impl ApprovalToken {
    pub fn new(token: impl Into<String>) -> Self {
        ApprovalToken(token.into())
    }

    fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.0.as_bytes()).into()
    }
}

/// A draft waiting for approval.
#[derive(Debug, Clone)]
struct StagedPolicy {
    draft: PolicyDraft,
    staged_at: DateTime<Utc>,
}

/// Public view of a staged draft.
#[derive(Debug, Clone, Serialize)]
pub struct StagedSummary {
    pub staged_id: u64,
    pub rules: usize,
    pub staged_at: DateTime<Utc>,
}

/// Staging area between "staged" and "active".
///
/// Drafts are validated when staged and only reach the store when promoted
/// with the configured approval token. Promotion replaces managed and custom
/// rules while keeping whatever mitigations are active at that moment.
pub struct PromotionGate {
    token_digest: Option<[u8; 32]>,
    mitigation_band: RangeInclusive<u32>,
    staged: Mutex<BTreeMap<u64, StagedPolicy>>,
    next_id: AtomicU64,
}

impl PromotionGate {
    /// Create a gate; `None` disables promotion entirely.
    pub fn new(approval_token: Option<&str>) -> Self {
        PromotionGate {
            token_digest: approval_token.map(|t| ApprovalToken::new(t).digest()),
            mitigation_band: DEFAULT_MITIGATION_BAND,
            staged: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Priorities staged drafts may not take.
    pub fn with_mitigation_band(mut self, band: RangeInclusive<u32>) -> Self {
        self.mitigation_band = band;
        self
    }

    /// Validate and stage a draft, returning its staged id.
    pub fn stage(&self, draft: PolicyDraft) -> Result<u64, GateError> {
        draft.validate()?;
        draft.check_mitigation_band(&self.mitigation_band)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.staged.lock().insert(
            id,
            StagedPolicy {
                draft,
                staged_at: Utc::now(),
            },
        );
        info!(staged_id = id, "Policy staged for approval");

        Ok(id)
    }

    /// Drafts currently staged.
    pub fn staged(&self) -> Vec<StagedSummary> {
        self.staged
            .lock()
            .iter()
            .map(|(id, staged)| StagedSummary {
                staged_id: *id,
                rules: staged.draft.rules.len(),
                staged_at: staged.staged_at,
            })
            .collect()
    }

    /// Promote a staged draft to active.
    ///
    /// The staged entry is consumed only when the publish succeeds.
    pub async fn promote(
        &self,
        store: &PolicyStore,
        staged_id: u64,
        token: &ApprovalToken,
        retry: &RetryPolicy,
    ) -> Result<Arc<PolicySet>, GateError> {
        let expected = self.token_digest.ok_or(GateError::Disabled)?;
        if token.digest() != expected {
            warn!(staged_id, "Policy promotion with invalid approval token");
            return Err(GateError::Unauthorized);
        }

        let staged = self
            .staged
            .lock()
            .get(&staged_id)
            .cloned()
            .ok_or(GateError::UnknownStaged(staged_id))?;

        let snapshot = store
            .publish_with_retry(retry, |base| {
                Ok(staged.draft.clone().with_mitigations_from(base))
            })
            .await?;

        self.staged.lock().remove(&staged_id);
        info!(staged_id, version = snapshot.version, "Staged policy promoted");

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Action;
    use crate::policy::snapshot::test_support::path_rule;

    fn staged_draft() -> PolicyDraft {
        PolicyDraft::new(Action::Allow, vec![path_rule("admin", 10, Action::Block, "/admin")])
    }

    #[tokio::test]
    async fn test_promote_requires_token() {
        let store = PolicyStore::new(Action::Allow);
        let gate = PromotionGate::new(Some("s3cret"));
        let id = gate.stage(staged_draft()).unwrap();
        let retry = RetryPolicy::default();

        let err = gate
            .promote(&store, id, &ApprovalToken::new("wrong"), &retry)
            .await
            .unwrap_err();
        assert_eq!(err, GateError::Unauthorized);
        assert_eq!(store.current().version, 0);

        let snapshot = gate
            .promote(&store, id, &ApprovalToken::new("s3cret"), &retry)
            .await
            .unwrap();
        assert_eq!(snapshot.version, 1);
        assert!(gate.staged().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_gate() {
        let store = PolicyStore::new(Action::Allow);
        let gate = PromotionGate::new(None);
        let id = gate.stage(staged_draft()).unwrap();

        let err = gate
            .promote(&store, id, &ApprovalToken::new("any"), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, GateError::Disabled);
    }

    #[tokio::test]
    async fn test_unknown_staged_id() {
        let store = PolicyStore::new(Action::Allow);
        let gate = PromotionGate::new(Some("t"));

        let err = gate
            .promote(&store, 42, &ApprovalToken::new("t"), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, GateError::UnknownStaged(42));
    }

    #[test]
    fn test_stage_validates() {
        let gate = PromotionGate::new(Some("t"));
        let invalid = PolicyDraft::new(
            Action::Allow,
            vec![
                path_rule("a", 10, Action::Block, "/a"),
                path_rule("b", 10, Action::Block, "/b"),
            ],
        );

        assert!(matches!(gate.stage(invalid), Err(GateError::Validation(_))));
    }

    #[test]
    fn test_stage_rejects_rules_in_mitigation_band() {
        let gate = PromotionGate::new(Some("t")).with_mitigation_band(500..=599);
        let in_band = PolicyDraft::new(Action::Allow, vec![path_rule("custom", 550, Action::Block, "/x")]);

        assert!(matches!(gate.stage(in_band), Err(GateError::Validation(_))));
        assert!(gate.staged().is_empty());

        // The default band does not apply once relocated.
        let at_1000 = PolicyDraft::new(Action::Allow, vec![path_rule("custom", 1000, Action::Block, "/x")]);
        assert!(gate.stage(at_1000).is_ok());
    }
}
