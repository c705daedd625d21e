use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::Action;
use crate::error::{ConflictError, ValidationError};
use crate::observability::metrics;

use super::retry::RetryPolicy;
use super::snapshot::{PolicyDraft, PolicySet};

/// Default number of published versions kept for rollback.
pub const DEFAULT_HISTORY_LIMIT: usize = 32;

/// Errors returned by the policy store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("publish deadline reached after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },

    #[error("policy version {0} is not retained")]
    UnknownVersion(u64),
}

/// Owner of every published policy version.
///
/// The active snapshot lives in a watch channel: readers clone the
/// `Arc<PolicySet>` and never observe a half-built policy, and the only
/// mutation is a compare-and-swap performed under the channel's lock.
pub struct PolicyStore {
    tx: watch::Sender<Arc<PolicySet>>,
    history: Mutex<VecDeque<Arc<PolicySet>>>,
    history_limit: usize,
}

impl PolicyStore {
    /// Create a store whose version 0 has no rules.
    pub fn new(default_action: Action) -> Self {
        PolicyStore::with_history_limit(default_action, DEFAULT_HISTORY_LIMIT)
    }

    /// Create a store retaining `history_limit` versions for rollback.
    pub fn with_history_limit(default_action: Action, history_limit: usize) -> Self {
        let initial = Arc::new(PolicySet::empty(default_action));
        let (tx, _rx) = watch::channel(initial.clone());

        let mut history = VecDeque::with_capacity(history_limit.max(1));
        history.push_back(initial);

        PolicyStore {
            tx,
            history: Mutex::new(history),
            history_limit: history_limit.max(1),
        }
    }

    /// The active snapshot.
    #[inline]
    pub fn current(&self) -> Arc<PolicySet> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PolicySet>> {
        self.tx.subscribe()
    }

    /// A retained version, if still in history.
    pub fn version(&self, version: u64) -> Option<Arc<PolicySet>> {
        self.history
            .lock()
            .iter()
            .find(|s| s.version == version)
            .cloned()
    }

    /// Versions currently retained, oldest first.
    pub fn retained_versions(&self) -> Vec<u64> {
        self.history.lock().iter().map(|s| s.version).collect()
    }

    /// Publish `draft` if the active version is still `expected_version`.
    ///
    /// The new snapshot gets version `expected_version + 1`. A mismatch
    /// returns [`ConflictError`]; the caller must re-read and rebuild.
    pub fn publish(
        &self,
        draft: PolicyDraft,
        expected_version: u64,
    ) -> Result<Arc<PolicySet>, StoreError> {
        if let Err(e) = draft.validate() {
            metrics::record_publish("rejected");
            return Err(e.into());
        }

        let mut outcome = Err(StoreError::Conflict(ConflictError {
            expected: expected_version,
            actual: expected_version,
            attempts: 1,
        }));

        self.tx.send_if_modified(|active| {
            if active.version != expected_version {
                outcome = Err(StoreError::Conflict(ConflictError {
                    expected: expected_version,
                    actual: active.version,
                    attempts: 1,
                }));
                return false;
            }

            let next = Arc::new(PolicySet::seal(active.version + 1, draft));
            self.retain(next.clone());
            *active = next.clone();
            outcome = Ok(next);
            true
        });

        match &outcome {
            Ok(snapshot) => {
                metrics::record_publish("applied");
                info!(
                    version = snapshot.version,
                    rules = snapshot.rules.len(),
                    "Policy published"
                );
            }
            Err(StoreError::Conflict(conflict)) => {
                metrics::record_publish("conflict");
                debug!(
                    expected = conflict.expected,
                    actual = conflict.actual,
                    "Policy publish lost compare-and-swap"
                );
            }
            Err(_) => {}
        }

        outcome
    }

    /// Rebuild a draft from the active snapshot and publish it, retrying on
    /// conflicts with bounded exponential backoff.
    ///
    /// `build` runs once per attempt against the freshly read snapshot.
    pub async fn publish_with_retry<F>(
        &self,
        retry: &RetryPolicy,
        mut build: F,
    ) -> Result<Arc<PolicySet>, StoreError>
    where
        F: FnMut(&PolicySet) -> Result<PolicyDraft, ValidationError>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let base = self.current();
            let draft = build(&base)?;

            match self.publish(draft, base.version) {
                Ok(snapshot) => return Ok(snapshot),
                Err(StoreError::Conflict(conflict)) => {
                    if attempt >= retry.max_attempts {
                        warn!(
                            attempts = attempt,
                            expected = conflict.expected,
                            actual = conflict.actual,
                            "Publish retry budget exhausted"
                        );
                        return Err(StoreError::Conflict(ConflictError {
                            attempts: attempt,
                            ..conflict
                        }));
                    }

                    let delay = retry.backoff(attempt);
                    if retry.would_exceed_deadline(delay) {
                        return Err(StoreError::DeadlineExceeded { attempts: attempt });
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Republish the content of a retained version as a new version.
    pub fn rollback(&self, version: u64) -> Result<Arc<PolicySet>, StoreError> {
        let target = self
            .version(version)
            .ok_or(StoreError::UnknownVersion(version))?;
        let base = self.current();

        let snapshot = self.publish(PolicyDraft::from_snapshot(&target), base.version)?;
        info!(
            from = base.version,
            restored = version,
            version = snapshot.version,
            "Policy rolled back"
        );

        Ok(snapshot)
    }

    fn retain(&self, snapshot: Arc<PolicySet>) {
        let mut history = self.history.lock();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(snapshot);
    }
}
