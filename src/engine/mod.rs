//! Rule matcher: the request path.

use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::domain::{Decision, DecisionStage, RequestDescriptor};
use crate::observability::metrics;
use crate::policy::{PolicySet, PolicyStore};

/// Evaluates requests against the active policy snapshot.
///
/// The matcher holds no state of its own: every evaluation clones the
/// store's current `Arc<PolicySet>` once and uses it throughout, so a
/// concurrent publish is either fully visible or not visible at all.
#[derive(Clone)]
pub struct RuleMatcher {
    store: Arc<PolicyStore>,
}

impl RuleMatcher {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        RuleMatcher { store }
    }

    /// Evaluate `req` against the active snapshot.
    pub fn evaluate(&self, req: &RequestDescriptor) -> Decision {
        let started = Instant::now();
        let snapshot = self.store.current();
        let decision = Self::evaluate_with(&snapshot, req);
        metrics::record_decision(decision.action, started);
        decision
    }

    /// Evaluate `req` against an explicit snapshot.
    ///
    /// Rules run in ascending priority and the first match wins. A rule
    /// whose predicate cannot be evaluated is skipped.
    pub fn evaluate_with(snapshot: &PolicySet, req: &RequestDescriptor) -> Decision {
        for rule in &snapshot.rules {
            match rule.evaluate(req) {
                Ok(true) => {
                    let mut decision = Decision::matched(
                        req.summary(),
                        rule.action(),
                        rule.id(),
                        rule.label(),
                        snapshot.version,
                    );
                    decision.advance(DecisionStage::Evaluated);
                    return decision;
                }
                Ok(false) => {}
                Err(e) => {
                    metrics::record_rule_error();
                    debug!(rule_id = rule.id(), error = %e, "Rule not evaluable, skipping");
                }
            }
        }

        let mut decision =
            Decision::default_action(req.summary(), snapshot.default_action, snapshot.version);
        decision.advance(DecisionStage::Evaluated);
        decision
    }

    /// The store this matcher reads from.
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }
}
