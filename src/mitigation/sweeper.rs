use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::policy::{PolicyDraft, PolicyStore, RetryPolicy, StoreError};

/// Removes mitigation rules whose TTL has passed.
pub struct ExpirySweeper {
    store: Arc<PolicyStore>,
    retry: RetryPolicy,
    check_interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<PolicyStore>, retry: RetryPolicy, check_interval: Duration) -> Self {
        ExpirySweeper {
            store,
            retry,
            check_interval,
        }
    }

    /// Publish a version without the mitigations expired at `now`.
    ///
    /// Returns how many rules were removed; no version is published when
    /// nothing has expired.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let has_expired = |snapshot: &crate::policy::PolicySet| {
            snapshot
                .rules
                .iter()
                .any(|r| r.source().is_mitigation() && r.def().is_expired(now))
        };

        if !has_expired(&self.store.current()) {
            return Ok(0);
        }

        let mut removed = 0;
        let snapshot = self
            .store
            .publish_with_retry(&self.retry, |base| {
                let mut draft = PolicyDraft::from_snapshot(base);
                removed = draft.remove_where(|r| r.source().is_mitigation() && r.def().is_expired(now));
                Ok(draft)
            })
            .await?;

        info!(removed, version = snapshot.version, "Expired mitigations removed");
        Ok(removed)
    }

    /// Sweep on a fixed interval in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = interval(self.check_interval);
            interval.tick().await;

            loop {
                interval.tick().await;

                match self.sweep(Utc::now()).await {
                    Ok(0) => debug!("No expired mitigations"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Mitigation sweep failed"),
                }
            }
        })
    }
}
