use thiserror::Error;

/// Rejection of malformed input before it can reach the policy store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid regex pattern '{pattern}': {reason}")]
    Regex { pattern: String, reason: String },

    #[error("invalid CIDR '{value}': {reason}")]
    Cidr { value: String, reason: String },

    #[error("unknown managed rule group '{0}'")]
    UnknownGroup(String),

    #[error("duplicate priority {priority} (rules '{first}' and '{second}')")]
    DuplicatePriority {
        priority: u32,
        first: String,
        second: String,
    },

    #[error("duplicate rule id '{0}'")]
    DuplicateRuleId(String),

    #[error("rule '{rule_id}': {reason}")]
    InvalidRule { rule_id: String, reason: String },

    #[error("mitigation priority band {min}..={max} is exhausted")]
    BandExhausted { min: u32, max: u32 },

    #[error("{0}")]
    Other(String),
}

/// A publish raced another writer and lost the compare-and-swap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("policy version conflict: expected {expected}, active is {actual} (after {attempts} attempt(s))")]
pub struct ConflictError {
    /// Version the caller based its draft on
    pub expected: u64,
    /// Version that was active when the swap was attempted
    pub actual: u64,
    /// Publish attempts made before giving up
    pub attempts: u32,
}
