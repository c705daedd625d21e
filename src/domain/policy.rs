use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Action;
use crate::predicate::PredicateDef;

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSource {
    /// Predefined signature bundle
    ManagedGroup,
    /// Application-specific rule
    Custom,
    /// Emergency block pushed outside the normal lifecycle
    Mitigation,
    /// Explicit pass-through
    Allowlist,
}

impl RuleSource {
    /// Returns true for rules owned by the mitigation publisher.
    #[inline]
    pub fn is_mitigation(&self) -> bool {
        *self == RuleSource::Mitigation
    }
}

/// Declarative definition of a single rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    /// Unique identifier within a policy
    pub id: String,

    /// Evaluation order, ascending
    pub priority: u32,

    /// Action taken when the predicate matches
    pub action: Action,

    /// KPI grouping label, defaults to the rule id
    #[serde(default)]
    pub label: Option<String>,

    /// Rule origin
    #[serde(default = "default_source")]
    pub source: RuleSource,

    /// Match condition
    pub predicate: PredicateDef,

    /// Automatic removal time (mitigations only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_source() -> RuleSource {
    RuleSource::Custom
}

impl RuleDef {
    /// Label used when grouping decisions for KPIs.
    pub fn effective_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    /// Returns true if the rule has an expiry at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Policy document as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDoc {
    /// Human-readable policy name
    #[serde(default)]
    pub name: String,

    /// Action applied when no rule matches
    #[serde(default)]
    pub default_action: Action,

    /// Rule definitions, any order
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{Constraint, TextTransform};

    #[test]
    fn test_policy_deserialization() {
        let yaml = r#"
name: juice-shop
default_action: ALLOW
rules:
  - id: sqli-search
    priority: 100
    action: BLOCK
    label: sqli
    predicate:
      type: query_match
      constraint: CONTAINS
      value: "' or 1=1"
      transforms: [URL_DECODE, LOWERCASE]
  - id: office-allow
    priority: 1
    action: ALLOW
    source: ALLOWLIST
    predicate:
      type: ip_set_match
      cidrs: ["203.0.113.0/24"]
"#;

        let doc: PolicyDoc = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.default_action, Action::Allow);
        assert_eq!(doc.rules.len(), 2);
        assert_eq!(doc.rules[0].source, RuleSource::Custom);
        assert_eq!(doc.rules[0].effective_label(), "sqli");
        assert_eq!(doc.rules[1].effective_label(), "office-allow");

        match &doc.rules[0].predicate {
            PredicateDef::QueryMatch {
                constraint,
                transforms,
                ..
            } => {
                assert_eq!(*constraint, Constraint::Contains);
                assert_eq!(
                    transforms.as_slice(),
                    &[TextTransform::UrlDecode, TextTransform::Lowercase]
                );
            }
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let rule = RuleDef {
            id: "m1".to_string(),
            priority: 1000,
            action: Action::Block,
            label: None,
            source: RuleSource::Mitigation,
            predicate: PredicateDef::IpSetMatch {
                cidrs: vec!["10.0.0.5/32".to_string()],
            },
            expires_at: Some(now - chrono::Duration::seconds(1)),
        };

        assert!(rule.is_expired(now));
        assert!(rule.source.is_mitigation());
    }
}
