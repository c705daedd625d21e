use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{Action, RuleDef, RuleSource};
use crate::error::{ConflictError, ValidationError};
use crate::observability::metrics;
use crate::policy::{
    PolicyDraft, PolicySet, PolicyStore, RetryPolicy, Rule, StoreError, DEFAULT_MITIGATION_BAND,
};

use super::indicator::{Indicator, IndicatorType};

/// Default time allowed from push to visible rule.
pub const DEFAULT_SLA: Duration = Duration::from_secs(60);

/// Default priority band reserved for mitigation rules.
pub const DEFAULT_BAND_MIN: u32 = *DEFAULT_MITIGATION_BAND.start();
pub const DEFAULT_BAND_MAX: u32 = *DEFAULT_MITIGATION_BAND.end();

/// Longest accepted time-to-live (one year).
pub const MAX_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Mitigation publisher settings.
#[derive(Debug, Clone, Copy)]
pub struct MitigationConfig {
    /// Upper bound for a whole push, retries included
    pub sla: Duration,

    /// Lowest priority a mitigation rule may take
    pub band_min: u32,

    /// Highest priority a mitigation rule may take
    pub band_max: u32,

    /// Backoff between conflicting publishes
    pub retry: RetryPolicy,
}

impl MitigationConfig {
    /// The reserved band as a range.
    pub fn band(&self) -> RangeInclusive<u32> {
        self.band_min..=self.band_max
    }
}

impl Default for MitigationConfig {
    fn default() -> Self {
        MitigationConfig {
            sla: DEFAULT_SLA,
            band_min: DEFAULT_BAND_MIN,
            band_max: DEFAULT_BAND_MAX,
            retry: RetryPolicy::default(),
        }
    }
}

/// Push-block request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitigationRequest {
    pub indicator_type: IndicatorType,
    pub indicator: String,
    /// Remove the rule automatically after this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl MitigationRequest {
    pub fn new(indicator_type: IndicatorType, indicator: impl Into<String>) -> Self {
        MitigationRequest {
            indicator_type,
            indicator: indicator.into(),
            ttl_seconds: None,
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }
}

/// Result of an applied push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitigationOutcome {
    pub accepted: bool,
    pub rule_id: String,
    pub applied_version: u64,
    pub elapsed_millis: u64,
}

/// Errors from pushing or removing a mitigation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MitigationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("mitigation '{rule_id}' was not applied within the SLA ({elapsed_ms} ms elapsed)")]
    Timeout { rule_id: String, elapsed_ms: u64 },

    #[error("no mitigation rule with id '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for MitigationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(v) => MitigationError::Validation(v),
            StoreError::Conflict(c) => MitigationError::Conflict(c),
            other => MitigationError::Store(other),
        }
    }
}

impl MitigationError {
    fn outcome(&self) -> &'static str {
        match self {
            MitigationError::Validation(_) => "invalid",
            MitigationError::Conflict(_) => "conflict",
            MitigationError::Timeout { .. } => "timeout",
            MitigationError::NotFound(_) => "not_found",
            MitigationError::Store(_) => "error",
        }
    }
}

/// Publishes emergency block rules into the policy store.
///
/// Mitigations live in their own priority band after the managed groups.
/// A push builds the next draft from the freshly read snapshot and swaps
/// it in with compare-and-swap, so it composes with file reloads and the
/// expiry sweeper instead of overwriting them.
pub struct MitigationPublisher {
    store: Arc<PolicyStore>,
    config: MitigationConfig,
}

impl MitigationPublisher {
    pub fn new(store: Arc<PolicyStore>, config: MitigationConfig) -> Self {
        MitigationPublisher { store, config }
    }

    /// Validate the indicator and publish a BLOCK rule for it.
    ///
    /// Pushing an indicator that is already mitigated refreshes the rule in
    /// place and keeps its priority.
    pub async fn push_block(
        &self,
        request: &MitigationRequest,
    ) -> Result<MitigationOutcome, MitigationError> {
        let started = Instant::now();

        let result = self.try_push(request, started).await;
        match &result {
            Ok(outcome) => {
                metrics::record_mitigation("applied", started);
                info!(
                    rule_id = %outcome.rule_id,
                    indicator = %request.indicator,
                    version = outcome.applied_version,
                    elapsed_ms = outcome.elapsed_millis,
                    "Mitigation applied"
                );
            }
            Err(e) => {
                metrics::record_mitigation(e.outcome(), started);
                warn!(indicator = %request.indicator, error = %e, "Mitigation rejected");
            }
        }

        result
    }

    async fn try_push(
        &self,
        request: &MitigationRequest,
        started: Instant,
    ) -> Result<MitigationOutcome, MitigationError> {
        let indicator = Indicator::parse(request.indicator_type, &request.indicator)?;
        let rule_id = indicator.rule_id();
        let expires_at = match request.ttl_seconds {
            Some(secs) if secs == 0 || secs > MAX_TTL_SECONDS => {
                return Err(ValidationError::Other(format!(
                    "ttlSeconds must be between 1 and {}",
                    MAX_TTL_SECONDS
                ))
                .into());
            }
            Some(secs) => Some(Utc::now() + chrono::Duration::seconds(secs as i64)),
            None => None,
        };

        let snapshot = self
            .publish_within(&rule_id, started, |base| {
                self.draft_with(base, &indicator, expires_at)
            })
            .await?;

        // The swap is synchronous; confirm the rule is what readers now see.
        let current = self.store.current();
        let accepted = current.version >= snapshot.version && snapshot.rule(&rule_id).is_some();

        Ok(MitigationOutcome {
            accepted,
            rule_id,
            applied_version: snapshot.version,
            elapsed_millis: started.elapsed().as_millis() as u64,
        })
    }

    /// Remove a mitigation rule by id.
    pub async fn remove(&self, rule_id: &str) -> Result<Arc<PolicySet>, MitigationError> {
        let started = Instant::now();
        let is_target = |r: &Rule| r.id() == rule_id && r.source().is_mitigation();

        if !self.store.current().rules.iter().any(|r| is_target(r)) {
            return Err(MitigationError::NotFound(rule_id.to_string()));
        }

        let snapshot = self
            .publish_within(rule_id, started, |base| {
                let mut draft = PolicyDraft::from_snapshot(base);
                draft.remove_where(is_target);
                Ok(draft)
            })
            .await?;

        info!(rule_id, version = snapshot.version, "Mitigation removed");
        Ok(snapshot)
    }

    /// Next draft: `base` plus the upserted mitigation rule.
    fn draft_with(
        &self,
        base: &PolicySet,
        indicator: &Indicator,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PolicyDraft, ValidationError> {
        let rule_id = indicator.rule_id();

        let priority = match base.rule(&rule_id) {
            Some(existing) => existing.priority(),
            None => self.free_priority(base)?,
        };

        let rule = Rule::compile(RuleDef {
            id: rule_id,
            priority,
            action: Action::Block,
            label: Some(indicator.label()),
            source: RuleSource::Mitigation,
            predicate: indicator.predicate_def(),
            expires_at,
        })?;

        let mut draft = PolicyDraft::from_snapshot(base);
        draft.upsert(Arc::new(rule));
        Ok(draft)
    }

    /// Lowest unused priority inside the band.
    fn free_priority(&self, base: &PolicySet) -> Result<u32, ValidationError> {
        let MitigationConfig {
            band_min, band_max, ..
        } = self.config;

        if let Some(managed) = base
            .rules
            .iter()
            .filter(|r| r.source() == RuleSource::ManagedGroup)
            .map(|r| r.priority())
            .max()
        {
            if managed >= band_min {
                return Err(ValidationError::Other(format!(
                    "mitigation band {}..={} must follow managed rule priorities (highest is {})",
                    band_min, band_max, managed
                )));
            }
        }

        let used: HashSet<u32> = base.rules.iter().map(|r| r.priority()).collect();
        (band_min..=band_max)
            .find(|p| !used.contains(p))
            .ok_or(ValidationError::BandExhausted {
                min: band_min,
                max: band_max,
            })
    }

    /// Compare-and-swap publish bounded by the SLA.
    ///
    /// Backoff that would cross the deadline is not started, and the outer
    /// timeout drops a pending retry. Either way nothing is half-applied:
    /// each attempt is a single synchronous swap.
    async fn publish_within<F>(
        &self,
        rule_id: &str,
        started: Instant,
        build: F,
    ) -> Result<Arc<PolicySet>, MitigationError>
    where
        F: FnMut(&PolicySet) -> Result<PolicyDraft, ValidationError>,
    {
        let deadline = tokio::time::Instant::now() + self.config.sla;
        let retry = self.config.retry.with_deadline(deadline);
        let timed_out = || MitigationError::Timeout {
            rule_id: rule_id.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        match tokio::time::timeout_at(deadline, self.store.publish_with_retry(&retry, build)).await
        {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(StoreError::DeadlineExceeded { attempts })) => {
                warn!(rule_id, attempts, "Mitigation publish ran out of time");
                Err(timed_out())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(timed_out()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestDescriptor;
    use crate::engine::RuleMatcher;
    use crate::policy::snapshot::test_support::{managed_rule, path_rule};

    fn publisher(config: MitigationConfig) -> (Arc<PolicyStore>, MitigationPublisher) {
        let store = Arc::new(PolicyStore::new(Action::Allow));
        (store.clone(), MitigationPublisher::new(store, config))
    }

    #[tokio::test]
    async fn test_ip_block_visible_within_sla() {
        let (store, publisher) = publisher(MitigationConfig::default());
        let matcher = RuleMatcher::new(store.clone());
        let attacker = RequestDescriptor::new("GET", "/").with_source("10.0.0.5");

        assert_eq!(matcher.evaluate(&attacker).action, Action::Allow);

        let outcome = publisher
            .push_block(&MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.5/32"))
            .await
            .unwrap();

        assert!(outcome.accepted);
        assert!(outcome.elapsed_millis < DEFAULT_SLA.as_millis() as u64);
        assert_eq!(outcome.applied_version, store.current().version);

        let decision = matcher.evaluate(&attacker);
        assert_eq!(decision.action, Action::Block);
        assert_eq!(decision.matched_rule_id.as_deref(), Some(outcome.rule_id.as_str()));
        assert_eq!(decision.label, "mitigation:10.0.0.5/32");

        let neighbour = RequestDescriptor::new("GET", "/").with_source("10.0.0.6");
        assert_eq!(matcher.evaluate(&neighbour).action, Action::Allow);
    }

    #[tokio::test]
    async fn test_repeated_push_is_upsert() {
        let (store, publisher) = publisher(MitigationConfig::default());
        let request = MitigationRequest::new(IndicatorType::UriPattern, "^/admin.*$");

        let first = publisher.push_block(&request).await.unwrap();
        let second = publisher.push_block(&request.clone().with_ttl(60)).await.unwrap();

        assert_eq!(first.rule_id, second.rule_id);
        let current = store.current();
        assert_eq!(current.count_source(RuleSource::Mitigation), 1);

        let rule = current.rule(&first.rule_id).unwrap();
        assert_eq!(rule.priority(), DEFAULT_BAND_MIN);
        assert!(rule.expires_at().is_some());
    }

    #[tokio::test]
    async fn test_band_allocation_skips_used_slots() {
        let (store, publisher) = publisher(MitigationConfig {
            band_min: 1000,
            band_max: 1002,
            ..Default::default()
        });
        store
            .publish(
                PolicyDraft::new(Action::Allow, vec![path_rule("custom", 1000, Action::Block, "/x")]),
                0,
            )
            .unwrap();

        let a = publisher
            .push_block(&MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.1/32"))
            .await
            .unwrap();
        let b = publisher
            .push_block(&MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.2/32"))
            .await
            .unwrap();
        let current = store.current();
        assert_eq!(current.rule(&a.rule_id).unwrap().priority(), 1001);
        assert_eq!(current.rule(&b.rule_id).unwrap().priority(), 1002);

        let err = publisher
            .push_block(&MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.3/32"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MitigationError::Validation(ValidationError::BandExhausted { min: 1000, max: 1002 })
        );
    }

    #[tokio::test]
    async fn test_band_must_follow_managed_rules() {
        let (store, publisher) = publisher(MitigationConfig {
            band_min: 100,
            band_max: 199,
            ..Default::default()
        });
        store
            .publish(
                PolicyDraft::new(
                    Action::Allow,
                    vec![managed_rule("managed-common", 150, "common-attacks")],
                ),
                0,
            )
            .unwrap();

        let err = publisher
            .push_block(&MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.5/32"))
            .await
            .unwrap_err();

        match err {
            MitigationError::Validation(e) => {
                assert!(e.to_string().contains("must follow managed rule priorities"))
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert_eq!(store.current().version, 1);
        assert_eq!(store.current().count_source(RuleSource::Mitigation), 0);
    }

    #[tokio::test]
    async fn test_invalid_indicators_leave_store_untouched() {
        let (store, publisher) = publisher(MitigationConfig::default());

        for request in [
            MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.5"),
            MitigationRequest::new(IndicatorType::IpCidr, "not-a-network/8"),
            MitigationRequest::new(IndicatorType::UriPattern, "(unclosed"),
            MitigationRequest::new(IndicatorType::IpCidr, "10.0.0.5/32").with_ttl(0),
        ] {
            let err = publisher.push_block(&request).await.unwrap_err();
            assert!(matches!(err, MitigationError::Validation(_)));
        }

        assert_eq!(store.current().version, 0);
    }

    #[tokio::test]
    async fn test_timeout_never_half_applies() {
        let (store, publisher) = publisher(MitigationConfig {
            sla: Duration::from_millis(30),
            retry: RetryPolicy::new(1000, Duration::from_millis(5), Duration::from_millis(5)),
            ..Default::default()
        });
        let indicator = Indicator::parse(IndicatorType::IpCidr, "10.0.0.5/32").unwrap();
        let rule_id = indicator.rule_id();

        let err = publisher
            .publish_within(&rule_id, Instant::now(), |base| {
                // A competing writer wins every race.
                store
                    .publish(PolicyDraft::from_snapshot(base), base.version)
                    .unwrap();
                publisher.draft_with(base, &indicator, None)
            })
            .await
            .unwrap_err();

        match err {
            MitigationError::Timeout { rule_id: id, .. } => assert_eq!(id, rule_id),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(store.current().rule(&rule_id).is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, publisher) = publisher(MitigationConfig::default());
        let outcome = publisher
            .push_block(&MitigationRequest::new(IndicatorType::IpCidr, "192.0.2.0/24"))
            .await
            .unwrap();

        let snapshot = publisher.remove(&outcome.rule_id).await.unwrap();
        assert!(snapshot.rule(&outcome.rule_id).is_none());
        assert_eq!(store.current().count_source(RuleSource::Mitigation), 0);

        assert_eq!(
            publisher.remove(&outcome.rule_id).await.unwrap_err(),
            MitigationError::NotFound(outcome.rule_id.clone())
        );
    }

    #[tokio::test]
    async fn test_remove_ignores_non_mitigation_rules() {
        let (store, publisher) = publisher(MitigationConfig::default());
        store
            .publish(
                PolicyDraft::new(Action::Allow, vec![path_rule("custom", 10, Action::Block, "/x")]),
                0,
            )
            .unwrap();

        assert!(matches!(
            publisher.remove("custom").await,
            Err(MitigationError::NotFound(_))
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let request: MitigationRequest = serde_json::from_str(
            r#"{"indicatorType": "IP_CIDR", "indicator": "10.0.0.5/32", "ttlSeconds": 300}"#,
        )
        .unwrap();
        assert_eq!(request.indicator_type, IndicatorType::IpCidr);
        assert_eq!(request.ttl_seconds, Some(300));

        let outcome = MitigationOutcome {
            accepted: true,
            rule_id: "mitigation-abc".to_string(),
            applied_version: 7,
            elapsed_millis: 3,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"ruleId\":\"mitigation-abc\""));
        assert!(json.contains("\"appliedVersion\":7"));
        assert!(json.contains("\"elapsedMillis\":3"));
    }
}
