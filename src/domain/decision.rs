use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::request::RequestSummary;

/// Label recorded when no rule matched and the default action applied.
pub const DEFAULT_ACTION_LABEL: &str = "default_action";

/// Outcome of evaluating a request against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Request is forwarded to the application
    Allow,
    /// Request is rejected at the edge
    Block,
}

impl Action {
    /// Returns true if this action blocks the request.
    #[inline]
    pub fn is_block(&self) -> bool {
        *self == Action::Block
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::Allow
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "ALLOW"),
            Action::Block => write!(f, "BLOCK"),
        }
    }
}

/// Lifecycle of a decision record.
///
/// Stages only move forward: a decision is created and evaluated on the
/// request path, accepted by the logger buffer, durably delivered by the
/// background flusher and finally counted by at least one KPI snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStage {
    New,
    Evaluated,
    Logged,
    Delivered,
    Aggregated,
}

impl DecisionStage {
    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            DecisionStage::New => Some(DecisionStage::Evaluated),
            DecisionStage::Evaluated => Some(DecisionStage::Logged),
            DecisionStage::Logged => Some(DecisionStage::Delivered),
            DecisionStage::Delivered => Some(DecisionStage::Aggregated),
            DecisionStage::Aggregated => None,
        }
    }

    /// Returns true if `to` is the immediate successor of this stage.
    pub fn can_advance_to(self, to: Self) -> bool {
        self.next() == Some(to)
    }

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionStage::New => "new",
            DecisionStage::Evaluated => "evaluated",
            DecisionStage::Logged => "logged",
            DecisionStage::Delivered => "delivered",
            DecisionStage::Aggregated => "aggregated",
        }
    }
}

/// Per-request outcome of evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Unique decision identifier (audit correlation)
    pub id: Uuid,

    /// When the decision was made
    pub timestamp: DateTime<Utc>,

    /// Summary of the evaluated request
    pub request: RequestSummary,

    /// Allow or block
    pub action: Action,

    /// Rule that produced the action, `None` when the default applied
    pub matched_rule_id: Option<String>,

    /// KPI grouping label of the matched rule
    pub label: String,

    /// Policy version the decision was evaluated against
    pub policy_version: u64,

    /// Lifecycle stage
    pub stage: DecisionStage,
}

impl Decision {
    /// Decision produced by a matching rule.
    pub fn matched(
        request: RequestSummary,
        action: Action,
        rule_id: impl Into<String>,
        label: impl Into<String>,
        policy_version: u64,
    ) -> Self {
        Decision {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request,
            action,
            matched_rule_id: Some(rule_id.into()),
            label: label.into(),
            policy_version,
            stage: DecisionStage::New,
        }
    }

    /// Decision produced by the snapshot's default action.
    pub fn default_action(request: RequestSummary, action: Action, policy_version: u64) -> Self {
        Decision {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request,
            action,
            matched_rule_id: None,
            label: DEFAULT_ACTION_LABEL.to_string(),
            policy_version,
            stage: DecisionStage::New,
        }
    }

    /// Move to `to` if it is the next stage; returns whether it moved.
    pub fn advance(&mut self, to: DecisionStage) -> bool {
        if self.stage.can_advance_to(to) {
            self.stage = to;
            true
        } else {
            false
        }
    }

    /// Returns true if this decision blocks the request.
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.action.is_block()
    }

    /// Returns true if the same rule produced the same action.
    ///
    /// Identifiers and timestamps differ between evaluations, so replay
    /// comparisons use this rather than `==`.
    pub fn same_outcome(&self, other: &Decision) -> bool {
        self.action == other.action
            && self.matched_rule_id == other.matched_rule_id
            && self.label == other.label
            && self.policy_version == other.policy_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serialization() {
        let json = serde_json::to_string(&Action::Block).unwrap();
        assert_eq!(json, "\"BLOCK\"");

        let parsed: Action = serde_json::from_str("\"ALLOW\"").unwrap();
        assert_eq!(parsed, Action::Allow);
    }

    #[test]
    fn test_stage_transitions() {
        assert!(DecisionStage::New.can_advance_to(DecisionStage::Evaluated));
        assert!(DecisionStage::Logged.can_advance_to(DecisionStage::Delivered));
        assert!(!DecisionStage::Evaluated.can_advance_to(DecisionStage::Delivered));
        assert!(!DecisionStage::Aggregated.can_advance_to(DecisionStage::New));
        assert_eq!(DecisionStage::Aggregated.next(), None);
    }

    #[test]
    fn test_default_decision_has_no_rule() {
        let summary = RequestSummary {
            method: "GET".to_string(),
            path: "/".to_string(),
            source_address: "192.0.2.1".to_string(),
        };
        let decision = Decision::default_action(summary, Action::Allow, 3);

        assert!(decision.matched_rule_id.is_none());
        assert_eq!(decision.label, DEFAULT_ACTION_LABEL);
        assert_eq!(decision.stage, DecisionStage::New);
        assert!(!decision.is_blocked());
    }

    #[test]
    fn test_advance_only_moves_forward_one_step() {
        let summary = RequestSummary {
            method: "GET".to_string(),
            path: "/".to_string(),
            source_address: "192.0.2.1".to_string(),
        };
        let mut decision = Decision::matched(summary, Action::Block, "r1", "sqli", 1);

        assert!(!decision.advance(DecisionStage::Logged));
        assert_eq!(decision.stage, DecisionStage::New);

        assert!(decision.advance(DecisionStage::Evaluated));
        assert!(decision.advance(DecisionStage::Logged));
        assert!(!decision.advance(DecisionStage::Evaluated));
        assert_eq!(decision.stage, DecisionStage::Logged);
    }
}
