//! Built-in managed rule groups.
//!
//! A managed group is a named bundle of signatures. Policies reference a
//! group by name and it expands into an OR of text predicates at compile
//! time.

use smallvec::smallvec;

use super::{Constraint, PredicateDef, TextTransform};

/// SQL injection signatures over query string and body.
pub const SQL_INJECTION: &str = "sql-injection";

/// Cross-site scripting, path traversal and scanner signatures.
pub const COMMON_ATTACKS: &str = "common-attacks";

const SQLI_PATTERN: &str = r"(?:'\s*(?:or|and)\s+[^\s=]+\s*=\s*[^\s=]+)|(?:\bunion(?:\s+all)?\s+select\b)|(?:;\s*(?:drop|delete|insert|update)\s)|(?:\bsleep\s*\(\s*\d+\s*\))";

const XSS_PATTERN: &str = r"(?:<script[\s>/])|(?:javascript:)|(?:\bon(?:error|load|mouseover)\s*=)";

const TRAVERSAL_PATTERN: &str = r"(?:\.\./)|(?:/etc/passwd)";

const SCANNER_PATTERN: &str = r"(?:sqlmap|nikto|nmap|masscan)";

/// Expand a managed group into its predicate definition.
pub fn group(name: &str) -> Option<PredicateDef> {
    match name {
        SQL_INJECTION => Some(PredicateDef::Or {
            children: vec![
                PredicateDef::QueryMatch {
                    argument: None,
                    constraint: Constraint::Regex,
                    value: SQLI_PATTERN.to_string(),
                    transforms: decoded(),
                },
                PredicateDef::BodyMatch {
                    constraint: Constraint::Regex,
                    value: SQLI_PATTERN.to_string(),
                    transforms: decoded(),
                },
            ],
        }),
        COMMON_ATTACKS => Some(PredicateDef::Or {
            children: vec![
                PredicateDef::QueryMatch {
                    argument: None,
                    constraint: Constraint::Regex,
                    value: XSS_PATTERN.to_string(),
                    transforms: decoded(),
                },
                PredicateDef::BodyMatch {
                    constraint: Constraint::Regex,
                    value: XSS_PATTERN.to_string(),
                    transforms: decoded(),
                },
                PredicateDef::PathMatch {
                    constraint: Constraint::Regex,
                    value: TRAVERSAL_PATTERN.to_string(),
                    transforms: smallvec![TextTransform::UrlDecode],
                },
                PredicateDef::HeaderMatch {
                    name: "user-agent".to_string(),
                    constraint: Constraint::Regex,
                    value: SCANNER_PATTERN.to_string(),
                    transforms: smallvec![TextTransform::Lowercase],
                },
            ],
        }),
        _ => None,
    }
}

fn decoded() -> smallvec::SmallVec<[TextTransform; 4]> {
    smallvec![
        TextTransform::UrlDecode,
        TextTransform::Lowercase,
        TextTransform::CompressWhitespace,
    ]
}
