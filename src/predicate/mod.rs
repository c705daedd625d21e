//! Composable request predicates.
//!
//! Policies describe predicates declaratively with [`PredicateDef`]; they
//! are compiled once into [`Predicate`] trees (regexes built, CIDRs parsed,
//! managed groups expanded) so evaluation on the request path only walks
//! the tree.

pub mod managed;
pub mod transform;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::net::IpAddr;
use thiserror::Error;

use crate::domain::RequestDescriptor;
use crate::error::ValidationError;

pub use transform::TextTransform;

/// Ordered transformation list; rules rarely chain more than a few.
pub type Transforms = SmallVec<[TextTransform; 4]>;

/// How the comparison value is positioned against the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Constraint {
    /// Candidate equals the value
    Exactly,
    /// Candidate contains the value
    Contains,
    /// Value is a regex that must match somewhere in the candidate
    Regex,
}

/// Declarative predicate as written in a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateDef {
    PathMatch {
        constraint: Constraint,
        value: String,
        #[serde(default)]
        transforms: Transforms,
    },
    QueryMatch {
        /// Match one named argument instead of the whole query string
        #[serde(default, skip_serializing_if = "Option::is_none")]
        argument: Option<String>,
        constraint: Constraint,
        value: String,
        #[serde(default)]
        transforms: Transforms,
    },
    HeaderMatch {
        name: String,
        constraint: Constraint,
        value: String,
        #[serde(default)]
        transforms: Transforms,
    },
    BodyMatch {
        constraint: Constraint,
        value: String,
        #[serde(default)]
        transforms: Transforms,
    },
    IpSetMatch {
        cidrs: Vec<String>,
    },
    ManagedGroup {
        name: String,
    },
    And {
        children: Vec<PredicateDef>,
    },
    Or {
        children: Vec<PredicateDef>,
    },
    Not {
        child: Box<PredicateDef>,
    },
}

/// A field could not be interpreted, so the predicate has no truth value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("unparseable source address '{0}'")]
    UnparseableAddress(String),
}

/// Comparison value, compiled.
#[derive(Debug, Clone)]
enum Pattern {
    Literal(String),
    Regex(Regex),
}

/// Text comparison with its transformation chain.
#[derive(Debug, Clone)]
pub struct TextMatcher {
    constraint: Constraint,
    pattern: Pattern,
    transforms: Transforms,
}

impl TextMatcher {
    /// Compile a comparison value under `constraint`.
    pub fn new(
        constraint: Constraint,
        value: &str,
        transforms: Transforms,
    ) -> Result<Self, ValidationError> {
        let pattern = match constraint {
            Constraint::Regex => Pattern::Regex(compile_regex(value)?),
            Constraint::Exactly | Constraint::Contains => Pattern::Literal(value.to_string()),
        };

        Ok(TextMatcher {
            constraint,
            pattern,
            transforms,
        })
    }

    /// Transform `candidate` and compare it against the pattern.
    pub fn is_match(&self, candidate: &str) -> bool {
        let value = transform::apply_all(&self.transforms, candidate);

        match (&self.pattern, self.constraint) {
            (Pattern::Regex(re), _) => re.is_match(&value),
            (Pattern::Literal(literal), Constraint::Exactly) => value == literal.as_str(),
            (Pattern::Literal(literal), _) => value.contains(literal.as_str()),
        }
    }
}

/// Compile a regex, mapping failures to a validation error.
pub fn compile_regex(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(pattern).map_err(|e| ValidationError::Regex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a CIDR, accepting a bare address as a single-host network.
/// True if any network holds `ip`, in its own form or, for an
/// IPv4-mapped IPv6 address, its IPv4 form.
pub fn networks_contain(networks: &[IpNet], ip: IpAddr) -> bool {
    let mapped = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
        IpAddr::V4(_) => None,
    };
    networks
        .iter()
        .any(|net| net.contains(&ip) || mapped.is_some_and(|v4| net.contains(&v4)))
}

pub fn parse_network(value: &str) -> Result<IpNet, ValidationError> {
    let trimmed = value.trim();
    if let Ok(net) = trimmed.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    trimmed
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| ValidationError::Cidr {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Compiled predicate tree.
#[derive(Debug, Clone)]
pub enum Predicate {
    Path(TextMatcher),
    Query {
        argument: Option<String>,
        matcher: TextMatcher,
    },
    Header {
        name: String,
        matcher: TextMatcher,
    },
    Body(TextMatcher),
    IpSet(Vec<IpNet>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Compile a definition.
    pub fn compile(def: &PredicateDef) -> Result<Self, ValidationError> {
        let predicate = match def {
            PredicateDef::PathMatch {
                constraint,
                value,
                transforms,
            } => Predicate::Path(TextMatcher::new(*constraint, value, transforms.clone())?),
            PredicateDef::QueryMatch {
                argument,
                constraint,
                value,
                transforms,
            } => Predicate::Query {
                argument: argument.clone(),
                matcher: TextMatcher::new(*constraint, value, transforms.clone())?,
            },
            PredicateDef::HeaderMatch {
                name,
                constraint,
                value,
                transforms,
            } => Predicate::Header {
                name: name.clone(),
                matcher: TextMatcher::new(*constraint, value, transforms.clone())?,
            },
            PredicateDef::BodyMatch {
                constraint,
                value,
                transforms,
            } => Predicate::Body(TextMatcher::new(*constraint, value, transforms.clone())?),
            PredicateDef::IpSetMatch { cidrs } => {
                if cidrs.is_empty() {
                    return Err(ValidationError::Other(
                        "ip_set_match needs at least one CIDR".to_string(),
                    ));
                }
                let networks = cidrs
                    .iter()
                    .map(|c| parse_network(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Predicate::IpSet(networks)
            }
            PredicateDef::ManagedGroup { name } => {
                let expanded = managed::group(name)
                    .ok_or_else(|| ValidationError::UnknownGroup(name.clone()))?;
                Predicate::compile(&expanded)?
            }
            PredicateDef::And { children } => Predicate::And(compile_children("and", children)?),
            PredicateDef::Or { children } => Predicate::Or(compile_children("or", children)?),
            PredicateDef::Not { child } => Predicate::Not(Box::new(Predicate::compile(child)?)),
        };

        Ok(predicate)
    }

    /// Evaluate against a request.
    ///
    /// Children are evaluated before their operator; AND stops at the first
    /// false child and OR at the first true one. An unevaluable field makes
    /// the whole tree unevaluable.
    pub fn evaluate(&self, req: &RequestDescriptor) -> Result<bool, EvalError> {
        match self {
            Predicate::Path(matcher) => Ok(matcher.is_match(&req.path)),
            Predicate::Query { argument, matcher } => Ok(match argument {
                Some(name) => req
                    .query_argument(name)
                    .is_some_and(|value| matcher.is_match(value)),
                None => matcher.is_match(&req.query),
            }),
            Predicate::Header { name, matcher } => Ok(req
                .header(name)
                .is_some_and(|value| matcher.is_match(value))),
            Predicate::Body(matcher) => Ok(req
                .body
                .as_deref()
                .is_some_and(|body| matcher.is_match(body))),
            Predicate::IpSet(networks) => {
                let ip = req
                    .source_ip()
                    .ok_or_else(|| EvalError::UnparseableAddress(req.source_address.clone()))?;
                Ok(networks_contain(networks, ip))
            }
            Predicate::And(children) => {
                for child in children {
                    if !child.evaluate(req)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(children) => {
                for child in children {
                    if child.evaluate(req)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(child) => Ok(!child.evaluate(req)?),
        }
    }

    /// Evaluate, treating an unevaluable tree as non-matching.
    #[inline]
    pub fn matches(&self, req: &RequestDescriptor) -> bool {
        self.evaluate(req).unwrap_or(false)
    }
}

fn compile_children(kind: &str, children: &[PredicateDef]) -> Result<Vec<Predicate>, ValidationError> {
    if children.is_empty() {
        return Err(ValidationError::Other(format!(
            "'{}' predicate needs at least one child",
            kind
        )));
    }
    children.iter().map(Predicate::compile).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn path(constraint: Constraint, value: &str) -> PredicateDef {
        PredicateDef::PathMatch {
            constraint,
            value: value.to_string(),
            transforms: Transforms::new(),
        }
    }

    fn ip_set(cidrs: &[&str]) -> PredicateDef {
        PredicateDef::IpSetMatch {
            cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_constraints() {
        let req = RequestDescriptor::new("GET", "/admin/users");

        let exact = Predicate::compile(&path(Constraint::Exactly, "/admin/users")).unwrap();
        let exact_miss = Predicate::compile(&path(Constraint::Exactly, "/admin")).unwrap();
        let contains = Predicate::compile(&path(Constraint::Contains, "admin")).unwrap();
        let regex = Predicate::compile(&path(Constraint::Regex, r"^/admin.*$")).unwrap();

        assert!(exact.matches(&req));
        assert!(!exact_miss.matches(&req));
        assert!(contains.matches(&req));
        assert!(regex.matches(&req));
    }

    #[test]
    fn test_transforms_apply_to_candidate_not_pattern() {
        // The pattern is upper case; lowering the candidate must not make it match.
        let def = PredicateDef::QueryMatch {
            argument: Some("q".to_string()),
            constraint: Constraint::Contains,
            value: "' OR 1=1".to_string(),
            transforms: smallvec![TextTransform::UrlDecode, TextTransform::Lowercase],
        };
        let predicate = Predicate::compile(&def).unwrap();
        let req = RequestDescriptor::new("GET", "/search?q=%27%20OR%201%3D1--");
        assert!(!predicate.matches(&req));

        let def = PredicateDef::QueryMatch {
            argument: Some("q".to_string()),
            constraint: Constraint::Contains,
            value: "' or 1=1".to_string(),
            transforms: smallvec![TextTransform::UrlDecode, TextTransform::Lowercase],
        };
        assert!(Predicate::compile(&def).unwrap().matches(&req));
    }

    #[test]
    fn test_header_and_body() {
        let header = Predicate::compile(&PredicateDef::HeaderMatch {
            name: "X-Api-Key".to_string(),
            constraint: Constraint::Exactly,
            value: "leaked".to_string(),
            transforms: Transforms::new(),
        })
        .unwrap();
        let body = Predicate::compile(&PredicateDef::BodyMatch {
            constraint: Constraint::Contains,
            value: "drop table".to_string(),
            transforms: smallvec![TextTransform::Lowercase, TextTransform::CompressWhitespace],
        })
        .unwrap();

        let req = RequestDescriptor::new("POST", "/api")
            .with_header("x-api-key", "leaked")
            .with_body("DROP   TABLE users");
        assert!(header.matches(&req));
        assert!(body.matches(&req));

        // Absent fields never match.
        let bare = RequestDescriptor::new("POST", "/api");
        assert!(!header.matches(&bare));
        assert!(!body.matches(&bare));
    }

    #[test]
    fn test_ip_set() {
        let predicate = Predicate::compile(&ip_set(&["10.0.0.0/8", "2001:db8::/32"])).unwrap();

        let inside = RequestDescriptor::new("GET", "/").with_source("10.1.2.3");
        let outside = RequestDescriptor::new("GET", "/").with_source("192.0.2.1");
        let v6 = RequestDescriptor::new("GET", "/").with_source("2001:db8::7");
        let mapped = RequestDescriptor::new("GET", "/").with_source("::ffff:10.9.9.9");

        assert!(predicate.matches(&inside));
        assert!(!predicate.matches(&outside));
        assert!(predicate.matches(&v6));
        assert!(predicate.matches(&mapped));
    }

    #[test]
    fn test_ip_set_mapped_addresses_match_both_forms() {
        let mapped = RequestDescriptor::new("GET", "/").with_source("::ffff:10.0.0.5");

        let v6_range = Predicate::compile(&ip_set(&["::ffff:0:0/96"])).unwrap();
        assert!(v6_range.matches(&mapped));
        assert!(!v6_range.matches(&RequestDescriptor::new("GET", "/").with_source("2001:db8::1")));

        let v4_range = Predicate::compile(&ip_set(&["10.0.0.0/8"])).unwrap();
        assert!(v4_range.matches(&mapped));

        let host = Predicate::compile(&ip_set(&["::ffff:10.0.0.5/128"])).unwrap();
        assert!(host.matches(&mapped));
        assert!(!host.matches(&RequestDescriptor::new("GET", "/").with_source("10.0.0.5")));
    }

    #[test]
    fn test_unparseable_address_is_not_a_match() {
        let predicate = Predicate::compile(&PredicateDef::Not {
            child: Box::new(ip_set(&["10.0.0.0/8"])),
        })
        .unwrap();
        let req = RequestDescriptor::new("GET", "/").with_source("unknown");

        assert_eq!(
            predicate.evaluate(&req),
            Err(EvalError::UnparseableAddress("unknown".to_string()))
        );
        assert!(!predicate.matches(&req));
    }

    #[test]
    fn test_composites_short_circuit() {
        // The second child is unevaluable; short-circuiting never reaches it.
        let and = Predicate::compile(&PredicateDef::And {
            children: vec![path(Constraint::Exactly, "/nope"), ip_set(&["10.0.0.0/8"])],
        })
        .unwrap();
        let or = Predicate::compile(&PredicateDef::Or {
            children: vec![path(Constraint::Exactly, "/"), ip_set(&["10.0.0.0/8"])],
        })
        .unwrap();

        let req = RequestDescriptor::new("GET", "/").with_source("garbage");
        assert_eq!(and.evaluate(&req), Ok(false));
        assert_eq!(or.evaluate(&req), Ok(true));
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(
            Predicate::compile(&path(Constraint::Regex, "(unclosed")),
            Err(ValidationError::Regex { .. })
        ));
        assert!(matches!(
            Predicate::compile(&ip_set(&["10.0.0.0/33"])),
            Err(ValidationError::Cidr { .. })
        ));
        assert!(matches!(
            Predicate::compile(&PredicateDef::ManagedGroup {
                name: "nope".to_string()
            }),
            Err(ValidationError::UnknownGroup(_))
        ));
        assert!(Predicate::compile(&PredicateDef::Or { children: vec![] }).is_err());
    }

    #[test]
    fn test_bare_address_network() {
        let net = parse_network("10.0.0.5").unwrap();
        assert_eq!(net.to_string(), "10.0.0.5/32");
        assert_eq!(parse_network("10.0.0.5/24").unwrap().to_string(), "10.0.0.0/24");
    }
}
