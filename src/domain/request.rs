use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Request descriptor handed over by the front door.
///
/// Headers are kept in a sorted map so lookups that fold case always see
/// entries in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// HTTP method (GET, POST, ...)
    pub method: String,

    /// URI path without the query string
    pub path: String,

    /// Raw query string without the leading `?`
    #[serde(default)]
    pub query: String,

    /// Request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Client address as seen by the front door
    #[serde(default)]
    pub source_address: String,

    /// Leading excerpt of the request body, if captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RequestDescriptor {
    /// Create a descriptor from a method and a request target.
    ///
    /// A `?` in the target splits it into path and query string.
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        RequestDescriptor {
            method: method.into(),
            path: path.to_string(),
            query: query.to_string(),
            ..Default::default()
        }
    }

    /// Set the client address.
    pub fn with_source(mut self, address: impl Into<String>) -> Self {
        self.source_address = address.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the body excerpt.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Look up a header value, ignoring ASCII case in the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Raw value of the first query argument called `name`.
    ///
    /// Argument names are compared after percent-decoding; the returned
    /// value is left encoded so rule transformations decide how to treat it.
    pub fn query_argument(&self, name: &str) -> Option<&str> {
        self.query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .find_map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let decoded = urlencoding::decode_binary(key.as_bytes());
                (String::from_utf8_lossy(&decoded) == name).then_some(value)
            })
    }

    /// Parse the client address as an IP.
    ///
    /// Accepts a bare address or a socket address (`ip:port`, `[v6]:port`).
    pub fn source_ip(&self) -> Option<IpAddr> {
        let raw = self.source_address.trim();
        raw.parse::<IpAddr>()
            .ok()
            .or_else(|| raw.parse::<std::net::SocketAddr>().ok().map(|s| s.ip()))
    }

    /// Compact summary carried by decisions.
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method.clone(),
            path: self.path.clone(),
            source_address: self.source_address.clone(),
        }
    }
}

/// The part of a request that is kept with its decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
    pub source_address: String,
}
