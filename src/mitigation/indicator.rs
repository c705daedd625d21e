use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::ValidationError;
use crate::predicate::{compile_regex, Constraint, PredicateDef, Transforms};

/// Prefix of every mitigation rule id.
pub const RULE_ID_PREFIX: &str = "mitigation-";

/// Prefix of every mitigation label.
pub const LABEL_PREFIX: &str = "mitigation:";

/// Kind of indicator an operator can block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndicatorType {
    /// Source address network
    IpCidr,
    /// Regex over the URI path
    UriPattern,
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorType::IpCidr => write!(f, "IP_CIDR"),
            IndicatorType::UriPattern => write!(f, "URI_PATTERN"),
        }
    }
}

/// A validated indicator in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indicator {
    Network(IpNet),
    UriPattern(String),
}

impl Indicator {
    /// Validate raw operator input.
    ///
    /// Networks need an explicit prefix length; host bits are cleared so
    /// `10.0.0.7/24` and `10.0.0.0/24` are the same indicator.
    pub fn parse(kind: IndicatorType, raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();

        match kind {
            IndicatorType::IpCidr => {
                if !raw.contains('/') {
                    return Err(ValidationError::Cidr {
                        value: raw.to_string(),
                        reason: "prefix length required (e.g. 203.0.113.10/32)".to_string(),
                    });
                }
                raw.parse::<IpNet>()
                    .map(|net| Indicator::Network(net.trunc()))
                    .map_err(|e| ValidationError::Cidr {
                        value: raw.to_string(),
                        reason: e.to_string(),
                    })
            }
            IndicatorType::UriPattern => {
                if raw.is_empty() {
                    return Err(ValidationError::Regex {
                        pattern: String::new(),
                        reason: "pattern cannot be empty".to_string(),
                    });
                }
                compile_regex(raw)?;
                Ok(Indicator::UriPattern(raw.to_string()))
            }
        }
    }

    pub fn kind(&self) -> IndicatorType {
        match self {
            Indicator::Network(_) => IndicatorType::IpCidr,
            Indicator::UriPattern(_) => IndicatorType::UriPattern,
        }
    }

    /// Canonical text form.
    pub fn canonical(&self) -> String {
        match self {
            Indicator::Network(net) => net.to_string(),
            Indicator::UriPattern(pattern) => pattern.clone(),
        }
    }

    /// Deterministic rule id: same indicator, same rule.
    pub fn rule_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.canonical().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}{}", RULE_ID_PREFIX, &digest[..16])
    }

    pub fn label(&self) -> String {
        format!("{}{}", LABEL_PREFIX, self.canonical())
    }

    /// Predicate that matches requests carrying this indicator.
    pub fn predicate_def(&self) -> PredicateDef {
        match self {
            Indicator::Network(net) => PredicateDef::IpSetMatch {
                cidrs: vec![net.to_string()],
            },
            Indicator::UriPattern(pattern) => PredicateDef::PathMatch {
                constraint: Constraint::Regex,
                value: pattern.clone(),
                transforms: Transforms::new(),
            },
        }
    }
}
