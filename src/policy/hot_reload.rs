use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

use crate::observability::metrics;

use super::loader::{PolicyError, PolicyLoader};
use super::retry::RetryPolicy;
use super::store::{PolicyStore, StoreError};

/// Errors raised while applying a changed policy file.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Watch the policy file and republish it when its content changes.
///
/// Reloads replace managed and custom rules; mitigation rules active at
/// publish time are carried over, so a reload racing a mitigation push
/// resolves through the store's compare-and-swap instead of dropping it.
pub struct PolicyWatcher {
    loader: PolicyLoader,
    store: Arc<PolicyStore>,
    retry: RetryPolicy,
    check_interval: Duration,
    last_hash: Option<String>,
}

impl PolicyWatcher {
    /// Create a new policy watcher.
    pub fn new(
        loader: PolicyLoader,
        store: Arc<PolicyStore>,
        retry: RetryPolicy,
        check_interval: Duration,
    ) -> Self {
        PolicyWatcher {
            loader,
            store,
            retry,
            check_interval,
            last_hash: None,
        }
    }

    /// Load the file once and publish it.
    pub async fn load_initial(&mut self) -> Result<u64, ReloadError> {
        self.apply().await
    }

    /// Start polling for changes in a background task.
    pub fn start(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = interval(self.check_interval);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;

                match self.check_for_updates().await {
                    Ok(Some(version)) => info!(version, "Policy reloaded successfully"),
                    Ok(None) => {} // No changes
                    Err(e) => {
                        metrics::record_policy_reload(false);
                        warn!(error = %e, "Error checking for policy updates");
                    }
                }
            }
        })
    }

    /// Republish if the file content changed; returns the new version.
    pub async fn check_for_updates(&mut self) -> Result<Option<u64>, ReloadError> {
        let hash = self.loader.content_hash()?;
        if self.last_hash.as_ref() == Some(&hash) {
            return Ok(None);
        }

        self.apply().await.map(Some)
    }

    async fn apply(&mut self) -> Result<u64, ReloadError> {
        let loaded = self.loader.load()?;
        let draft = loaded.draft;

        let snapshot = self
            .store
            .publish_with_retry(&self.retry, |base| {
                Ok(draft.clone().with_mitigations_from(base))
            })
            .await?;

        info!(
            path = %self.loader.policy_path().display(),
            name = %loaded.doc.name,
            hash = %&loaded.content_hash[..12],
            version = snapshot.version,
            "Policy file applied"
        );
        metrics::record_policy_reload(true);
        self.last_hash = Some(loaded.content_hash);

        Ok(snapshot.version)
    }
}
