use serde::{Deserialize, Serialize};

use crate::domain::{Action, Decision};

/// One line of the durable decision log.
///
/// ```json
/// {"timestamp": 1718000000000, "action": "BLOCK", "matchedRuleId": "managed-sqli", "label": "AWSManagedRulesSQLiRuleSet"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Decision time, epoch milliseconds
    pub timestamp: i64,

    pub action: Action,

    /// `null` when the default action applied
    pub matched_rule_id: Option<String>,

    pub label: String,
}

impl LogRecord {
    pub fn from_decision(decision: &Decision) -> Self {
        LogRecord {
            timestamp: decision.timestamp.timestamp_millis(),
            action: decision.action,
            matched_rule_id: decision.matched_rule_id.clone(),
            label: decision.label.clone(),
        }
    }

    /// Serialize as a single JSON line, newline excluded.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON line.
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
