use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::PolicyDoc;
use crate::error::ValidationError;

use super::snapshot::{PolicyDraft, DEFAULT_MITIGATION_BAND};

/// Errors that can occur during policy loading.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Parse and validate a policy document from YAML text.
pub fn parse_policy(content: &str) -> Result<PolicyDoc, PolicyError> {
    let doc: PolicyDoc = serde_yaml::from_str(content)?;
    validate_policy(&doc)?;
    Ok(doc)
}

/// Validate policy configuration.
fn validate_policy(doc: &PolicyDoc) -> Result<(), ValidationError> {
    let mut seen_ids = HashSet::new();
    let mut seen_priorities = HashSet::new();

    for rule in &doc.rules {
        if !seen_ids.insert(&rule.id) {
            return Err(ValidationError::DuplicateRuleId(rule.id.clone()));
        }
        if !seen_priorities.insert(rule.priority) {
            return Err(ValidationError::InvalidRule {
                rule_id: rule.id.clone(),
                reason: format!("priority {} is already used", rule.priority),
            });
        }
        if rule.source.is_mitigation() {
            return Err(ValidationError::InvalidRule {
                rule_id: rule.id.clone(),
                reason: "mitigation rules are managed through the mitigation API".to_string(),
            });
        }
    }

    Ok(())
}

/// A loaded policy file.
#[derive(Debug)]
pub struct LoadedPolicy {
    pub doc: PolicyDoc,
    pub draft: PolicyDraft,
    /// SHA-256 of the file content, hex encoded
    pub content_hash: String,
}

/// Policy loader bound to one file.
pub struct PolicyLoader {
    policy_path: PathBuf,
    mitigation_band: RangeInclusive<u32>,
}

impl PolicyLoader {
    /// Create a new policy loader.
    pub fn new(policy_path: impl Into<PathBuf>) -> Self {
        PolicyLoader {
            policy_path: policy_path.into(),
            mitigation_band: DEFAULT_MITIGATION_BAND,
        }
    }

    /// Priorities file rules may not take.
    pub fn with_mitigation_band(mut self, band: RangeInclusive<u32>) -> Self {
        self.mitigation_band = band;
        self
    }

    /// Load, validate and compile the policy.
    pub fn load(&self) -> Result<LoadedPolicy, PolicyError> {
        let content = fs::read_to_string(&self.policy_path)?;
        let content_hash = hex::encode(Sha256::digest(content.as_bytes()));
        let doc = parse_policy(&content)?;
        let draft = PolicyDraft::from_doc(doc.clone())?;
        draft.check_mitigation_band(&self.mitigation_band)?;

        Ok(LoadedPolicy {
            doc,
            draft,
            content_hash,
        })
    }

    /// Hash of the current file content without parsing it.
    pub fn content_hash(&self) -> Result<String, PolicyError> {
        let content = fs::read(&self.policy_path)?;
        Ok(hex::encode(Sha256::digest(&content)))
    }

    /// Get the policy file path.
    pub fn policy_path(&self) -> &Path {
        &self.policy_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Action;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const POLICY: &str = r#"
name: juice-shop
default_action: ALLOW
rules:
  - id: managed-sqli
    priority: 10
    action: BLOCK
    source: MANAGED_GROUP
    label: AWSManagedRulesSQLiRuleSet
    predicate:
      type: managed_group
      name: sql-injection
  - id: admin-path
    priority: 100
    action: BLOCK
    predicate:
      type: path_match
      constraint: REGEX
      value: "^/admin"
"#;

    #[test]
    fn test_policy_loader_compiles() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", POLICY).unwrap();

        let loader = PolicyLoader::new(file.path());
        let loaded = loader.load().unwrap();

        assert_eq!(loaded.doc.name, "juice-shop");
        assert_eq!(loaded.doc.default_action, Action::Allow);
        assert_eq!(loaded.draft.rules.len(), 2);
        assert_eq!(loaded.content_hash.len(), 64);
        assert_eq!(loaded.content_hash, loader.content_hash().unwrap());
    }

    #[test]
    fn test_policy_validation_duplicate_ids() {
        let result = parse_policy(
            r#"
rules:
  - id: R1
    priority: 1
    action: BLOCK
    predicate: {type: path_match, constraint: EXACTLY, value: "/a"}
  - id: R1
    priority: 2
    action: BLOCK
    predicate: {type: path_match, constraint: EXACTLY, value: "/b"}
"#,
        );

        assert!(result.unwrap_err().to_string().contains("duplicate rule id"));
    }

    #[test]
    fn test_policy_validation_duplicate_priorities() {
        let result = parse_policy(
            r#"
rules:
  - id: R1
    priority: 5
    action: BLOCK
    predicate: {type: path_match, constraint: EXACTLY, value: "/a"}
  - id: R2
    priority: 5
    action: ALLOW
    predicate: {type: path_match, constraint: EXACTLY, value: "/b"}
"#,
        );

        assert!(result.unwrap_err().to_string().contains("priority 5"));
    }

    #[test]
    fn test_mitigations_not_allowed_in_file() {
        let result = parse_policy(
            r#"
rules:
  - id: M1
    priority: 1000
    action: BLOCK
    source: MITIGATION
    predicate: {type: ip_set_match, cidrs: ["10.0.0.5/32"]}
"#,
        );

        assert!(matches!(result, Err(PolicyError::Validation(_))));
    }

    #[test]
    fn test_mitigation_band_is_reserved_for_mitigations() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
rules:
  - id: custom-late
    priority: 1500
    action: BLOCK
    predicate: {{type: path_match, constraint: EXACTLY, value: "/late"}}
"#
        )
        .unwrap();

        let err = PolicyLoader::new(file.path()).load().unwrap_err();
        assert!(matches!(err, PolicyError::Validation(_)));
        assert!(err.to_string().contains("custom-late"));

        // Outside a relocated band the same file is fine.
        let loaded = PolicyLoader::new(file.path())
            .with_mitigation_band(5000..=5999)
            .load()
            .unwrap();
        assert_eq!(loaded.draft.rules.len(), 1);
    }

    #[test]
    fn test_bad_regex_is_a_load_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
rules:
  - id: broken
    priority: 1
    action: BLOCK
    predicate: {{type: path_match, constraint: REGEX, value: "(unclosed"}}
"#
        )
        .unwrap();

        let err = PolicyLoader::new(file.path()).load().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
