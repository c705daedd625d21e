use axum::http::{HeaderMap, Method, Uri};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::domain::RequestDescriptor;
use crate::predicate::networks_contain;

/// Longest body prefix handed to body predicates.
pub const BODY_EXCERPT_LIMIT: usize = 8 * 1024;

/// Header carrying the approval token on promotion.
pub const APPROVAL_TOKEN_HEADER: &str = "x-approval-token";

/// Query string of `GET /v1/kpi`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KpiQuery {
    /// Window start, epoch milliseconds
    pub start: Option<i64>,
    /// Window end, epoch milliseconds
    pub end: Option<i64>,
}

/// Build a descriptor from a live HTTP request.
///
/// The client address is the peer address of the connection. The first
/// `X-Forwarded-For` entry replaces it only when that peer is one of the
/// `trusted_proxies`; anyone else could claim any address with the header.
pub fn describe_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpNet],
    body: &[u8],
) -> RequestDescriptor {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let mut descriptor = RequestDescriptor::new(method.as_str(), target);

    for (name, value) in headers {
        // Non-UTF-8 header values cannot match a text predicate.
        if let Ok(value) = value.to_str() {
            descriptor = descriptor.with_header(name.as_str(), value);
        }
    }

    let peer_ip = peer.map(|p| p.ip());
    let forwarded = peer_ip
        .filter(|ip| networks_contain(trusted_proxies, *ip))
        .and_then(|_| descriptor.header("x-forwarded-for"))
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let source = forwarded.or_else(|| peer_ip.map(|ip| ip.to_string()));
    if let Some(source) = source {
        descriptor = descriptor.with_source(source);
    }

    if !body.is_empty() {
        let excerpt = &body[..body.len().min(BODY_EXCERPT_LIMIT)];
        descriptor = descriptor.with_body(String::from_utf8_lossy(excerpt));
    }

    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn proxies() -> Vec<IpNet> {
        vec!["127.0.0.0/8".parse().unwrap(), "10.1.0.0/16".parse().unwrap()]
    }

    #[test]
    fn test_forwarded_for_from_trusted_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.5, 172.16.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();

        let req = describe_request(
            &Method::GET,
            &"/rest/products/search?q=apple".parse().unwrap(),
            &headers,
            Some(peer),
            &proxies(),
            b"",
        );

        assert_eq!(req.source_address, "10.0.0.5");
        assert_eq!(req.path, "/rest/products/search");
        assert_eq!(req.query, "q=apple");
        assert_eq!(req.header("User-Agent"), Some("curl/8.0"));
        assert!(req.body.is_none());
    }

    #[test]
    fn test_forwarded_for_ignored_from_untrusted_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.1"));
        let peer: SocketAddr = "198.51.100.9:40000".parse().unwrap();
        let uri: Uri = "/".parse().unwrap();

        let req = describe_request(&Method::GET, &uri, &headers, Some(peer), &proxies(), b"");
        assert_eq!(req.source_address, "198.51.100.9");

        // No trusted proxies configured: the header is never honoured.
        let req = describe_request(&Method::GET, &uri, &headers, Some(peer), &[], b"");
        assert_eq!(req.source_address, "198.51.100.9");

        // Without a peer there is nothing to vouch for the header.
        let req = describe_request(&Method::GET, &uri, &headers, None, &proxies(), b"");
        assert!(req.source_address.is_empty());
    }

    #[test]
    fn test_mapped_peer_matches_v4_proxy_range() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.7"));
        let peer: SocketAddr = "[::ffff:10.1.2.3]:8443".parse().unwrap();

        let req = describe_request(&Method::GET, &"/".parse().unwrap(), &headers, Some(peer), &proxies(), b"");
        assert_eq!(req.source_address, "192.0.2.7");
    }

    #[test]
    fn test_peer_address_and_body_excerpt() {
        let peer: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let body = vec![b'a'; BODY_EXCERPT_LIMIT + 10];

        let req = describe_request(&Method::POST, &"/login".parse().unwrap(), &HeaderMap::new(), Some(peer), &[], &body);

        assert_eq!(req.source_address, "2001:db8::1");
        assert_eq!(req.body.as_ref().map(String::len), Some(BODY_EXCERPT_LIMIT));
    }

    #[test]
    fn test_no_address_known() {
        let req = describe_request(&Method::GET, &"/".parse().unwrap(), &HeaderMap::new(), None, &[], b"");
        assert!(req.source_address.is_empty());
        assert!(req.source_ip().is_none());
    }
}
