use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::domain::{Action, PolicyDoc, RequestDescriptor, RuleDef, RuleSource};
use crate::error::ValidationError;
use crate::predicate::{EvalError, Predicate};

/// Priorities reserved for mitigation rules unless configured otherwise.
pub const DEFAULT_MITIGATION_BAND: RangeInclusive<u32> = 1000..=1999;

/// A rule with its predicate compiled.
///
/// Rules are shared between snapshots through `Arc`, so republishing a
/// policy that keeps most of its rules does not recompile them.
#[derive(Debug)]
pub struct Rule {
    def: RuleDef,
    predicate: Predicate,
}

impl Rule {
    /// Compile a rule definition.
    pub fn compile(def: RuleDef) -> Result<Self, ValidationError> {
        if def.id.trim().is_empty() {
            return Err(ValidationError::InvalidRule {
                rule_id: def.id,
                reason: "rule id cannot be empty".to_string(),
            });
        }

        let predicate =
            Predicate::compile(&def.predicate).map_err(|e| ValidationError::InvalidRule {
                rule_id: def.id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Rule { def, predicate })
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn priority(&self) -> u32 {
        self.def.priority
    }

    pub fn action(&self) -> Action {
        self.def.action
    }

    pub fn label(&self) -> &str {
        self.def.effective_label()
    }

    pub fn source(&self) -> RuleSource {
        self.def.source
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.def.expires_at
    }

    /// The declarative definition this rule was compiled from.
    pub fn def(&self) -> &RuleDef {
        &self.def
    }

    /// Evaluate the rule's predicate.
    #[inline]
    pub fn evaluate(&self, req: &RequestDescriptor) -> Result<bool, EvalError> {
        self.predicate.evaluate(req)
    }
}

/// Candidate content for the next published version.
#[derive(Debug, Clone)]
pub struct PolicyDraft {
    pub default_action: Action,
    pub rules: Vec<Arc<Rule>>,
}

impl PolicyDraft {
    /// Create a draft from compiled rules.
    pub fn new(default_action: Action, rules: Vec<Arc<Rule>>) -> Self {
        PolicyDraft {
            default_action,
            rules,
        }
    }

    /// Compile every rule of a policy document.
    pub fn from_doc(doc: PolicyDoc) -> Result<Self, ValidationError> {
        let rules = doc
            .rules
            .into_iter()
            .map(|def| Rule::compile(def).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PolicyDraft::new(doc.default_action, rules))
    }

    /// Draft that carries the content of an existing snapshot.
    pub fn from_snapshot(snapshot: &PolicySet) -> Self {
        PolicyDraft::new(snapshot.default_action, snapshot.rules.clone())
    }

    /// Insert `rule`, replacing any rule with the same id.
    pub fn upsert(&mut self, rule: Arc<Rule>) {
        match self.rules.iter_mut().find(|r| r.id() == rule.id()) {
            Some(slot) => *slot = rule,
            None => self.rules.push(rule),
        }
    }

    /// Remove rules matching `predicate`, returning how many were removed.
    pub fn remove_where(&mut self, predicate: impl Fn(&Rule) -> bool) -> usize {
        let before = self.rules.len();
        self.rules.retain(|r| !predicate(r));
        before - self.rules.len()
    }

    /// Keep this draft's non-mitigation rules and carry over the active
    /// mitigation rules of `base`.
    ///
    /// Policy file reloads and approved promotions replace the managed and
    /// custom rules wholesale; mitigations have their own lifecycle.
    pub fn with_mitigations_from(mut self, base: &PolicySet) -> Self {
        self.rules.retain(|r| !r.source().is_mitigation());
        self.rules.extend(
            base.rules
                .iter()
                .filter(|r| r.source().is_mitigation())
                .cloned(),
        );
        self
    }

    /// Check id and priority uniqueness.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut ids = HashSet::with_capacity(self.rules.len());
        let mut priorities: HashMap<u32, &str> = HashMap::with_capacity(self.rules.len());

        for rule in &self.rules {
            if !ids.insert(rule.id()) {
                return Err(ValidationError::DuplicateRuleId(rule.id().to_string()));
            }
            if let Some(first) = priorities.insert(rule.priority(), rule.id()) {
                return Err(ValidationError::DuplicatePriority {
                    priority: rule.priority(),
                    first: first.to_string(),
                    second: rule.id().to_string(),
                });
            }
        }

        Ok(())
    }

    /// Keep `band` to mitigation rules and managed groups ahead of it.
    ///
    /// Only mitigation publishes may place rules inside the band, and the
    /// managed groups must all evaluate before any mitigation does.
    pub fn check_mitigation_band(&self, band: &RangeInclusive<u32>) -> Result<(), ValidationError> {
        for rule in self.rules.iter().filter(|r| !r.source().is_mitigation()) {
            let priority = rule.priority();
            let reason = if band.contains(&priority) {
                format!(
                    "priority {} is reserved for mitigations ({}..={})",
                    priority,
                    band.start(),
                    band.end()
                )
            } else if rule.source() == RuleSource::ManagedGroup && priority > *band.end() {
                format!(
                    "managed rule groups must come before the mitigation band starting at {}",
                    band.start()
                )
            } else {
                continue;
            };

            return Err(ValidationError::InvalidRule {
                rule_id: rule.id().to_string(),
                reason,
            });
        }

        Ok(())
    }
}

/// Published, immutable policy version.
#[derive(Debug)]
pub struct PolicySet {
    /// Monotonic version number
    pub version: u64,

    /// Rules sorted by ascending priority
    pub rules: Vec<Arc<Rule>>,

    /// Action applied when no rule matches
    pub default_action: Action,

    /// When this version became active
    pub published_at: DateTime<Utc>,
}

impl PolicySet {
    /// Seal a validated draft as `version`.
    pub(crate) fn seal(version: u64, draft: PolicyDraft) -> Self {
        let mut rules = draft.rules;
        rules.sort_by_key(|r| r.priority());

        PolicySet {
            version,
            rules,
            default_action: draft.default_action,
            published_at: Utc::now(),
        }
    }

    /// Version 0: no rules.
    pub fn empty(default_action: Action) -> Self {
        PolicySet {
            version: 0,
            rules: Vec::new(),
            default_action,
            published_at: Utc::now(),
        }
    }

    /// Find a rule by id.
    pub fn rule(&self, id: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.id() == id)
    }

    /// Number of rules from a given source.
    pub fn count_source(&self, source: RuleSource) -> usize {
        self.rules.iter().filter(|r| r.source() == source).count()
    }

    /// Serializable summary of this snapshot.
    pub fn summary(&self) -> PolicySummary {
        PolicySummary {
            version: self.version,
            default_action: self.default_action,
            published_at: self.published_at,
            rules: self.rules.iter().map(|r| r.def().clone()).collect(),
        }
    }
}

/// JSON view of a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub version: u64,
    pub default_action: Action,
    pub published_at: DateTime<Utc>,
    pub rules: Vec<RuleDef>,
}
