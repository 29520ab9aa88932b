//! Header manipulation and security headers.
//!
//! # Responsibilities
//! - Add security response headers
//! - Strip hop-by-hop and distributed tracing headers
//! - Set X-Forwarded-* for the upstream
//!
//! # Design Decisions
//! - Client-supplied X-Forwarded-For / X-Real-IP are dropped unless the
//!   deployment trusts the hop in front of the gateway

use std::net::IpAddr;

use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue};

/// Headers marking the request as part of a distributed trace.
pub const TRACING_HEADERS: &[&str] = &[
    "x-b3-traceid",
    "x-b3-spanid",
    "x-b3-parentspanid",
    "x-b3-sampled",
    "uber-trace-id",
    "jaeger-baggage",
    "traceparent",
    "tracestate",
];

/// Connection-scoped headers never forwarded to the upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_REAL_IP: &str = "x-real-ip";

pub fn inject_security_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-transform"));
}

pub fn strip_tracing_headers(headers: &mut HeaderMap) {
    for name in TRACING_HEADERS {
        headers.remove(*name);
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Drop client-provided forwarding headers.
pub fn strip_forwarded_for(headers: &mut HeaderMap) {
    headers.remove(X_FORWARDED_FOR);
    headers.remove(X_REAL_IP);
}

/// Append the client IP to `X-Forwarded-For` and record the original host
/// and scheme.
pub fn set_forwarded(headers: &mut HeaderMap, client: IpAddr, host: Option<HeaderValue>, tls: bool) {
    let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, client),
        _ => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if tls { "https" } else { "http" }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_headers_present() {
        let mut h = HeaderMap::new();
        inject_security_headers(&mut h);
        assert_eq!(h[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(h[header::CACHE_CONTROL], "private, no-transform");
        assert_eq!(h["x-xss-protection"], "1; mode=block");
    }

    #[test]
    fn tracing_headers_removed() {
        let mut h = HeaderMap::new();
        h.insert("x-b3-traceid", HeaderValue::from_static("abc"));
        h.insert("traceparent", HeaderValue::from_static("00-1-2-01"));
        h.insert("authorization", HeaderValue::from_static("Bearer x"));
        strip_tracing_headers(&mut h);

        assert!(h.get("x-b3-traceid").is_none());
        assert!(h.get("traceparent").is_none());
        assert!(h.get("authorization").is_some());
    }

    #[test]
    fn hop_by_hop_and_connection_named_removed() {
        let mut h = HeaderMap::new();
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        h.insert("x-secret", HeaderValue::from_static("1"));
        h.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        h.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        h.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut h);

        assert_eq!(h.len(), 1);
        assert!(h.get(header::ACCEPT).is_some());
    }

    #[test]
    fn forwarded_for_appends() {
        let mut h = HeaderMap::new();
        h.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));
        set_forwarded(&mut h, "2.2.2.2".parse().unwrap(), Some(HeaderValue::from_static("api.io")), true);

        assert_eq!(h[X_FORWARDED_FOR], "1.1.1.1, 2.2.2.2");
        assert_eq!(h[X_FORWARDED_HOST], "api.io");
        assert_eq!(h[X_FORWARDED_PROTO], "https");

        strip_forwarded_for(&mut h);
        set_forwarded(&mut h, "3.3.3.3".parse().unwrap(), None, false);
        assert_eq!(h[X_FORWARDED_FOR], "3.3.3.3");
        assert_eq!(h[X_FORWARDED_PROTO], "http");
    }
}
