//! Request handling and transformation.
//!
//! # Responsibilities
//! - Generate unique request ID (UUID v4)
//! - Carry connection facts (client address, TLS peer) to the pipeline
//! - Detect WebSocket upgrades
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Connection facts are attached as a request extension by the server,
//!   so extractors and rewriters never touch the socket

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::{HeaderName, Request};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Marks a request forwarded as a WebSocket. Never accepted from clients.
pub const INTERNAL_WS_MARKER: &str = "__internal_ws__";

/// Facts about the connection a request arrived on.
///
/// `remote_addr` is the proxy-protocol source when the connection was
/// unwrapped, the socket peer otherwise.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub remote_addr: SocketAddr,
    /// DER encoding of the client certificate, when exactly one was presented.
    pub peer_certificate: Option<Vec<u8>>,
    pub tls: bool,
}

impl ClientInfo {
    pub fn plain(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            peer_certificate: None,
            tls: false,
        }
    }

    pub fn tls(remote_addr: SocketAddr, peer_certificate: Option<Vec<u8>>) -> Self {
        Self {
            remote_addr,
            peer_certificate,
            tls: true,
        }
    }
}

/// UUID v4 request IDs for `SetRequestIdLayer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        Uuid::new_v4().to_string().parse().ok().map(RequestId::new)
    }
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(req: &Request<Body>) -> bool {
    let has_token = |name: HeaderName, token: &str| {
        req.headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(token))
    };

    has_token(CONNECTION, "upgrade") && has_token(UPGRADE, "websocket")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let req = Request::new(());
        let mut make = MakeRequestUuid;
        let a = make.make_request_id(&req).unwrap();
        let b = make.make_request_id(&req).unwrap();
        assert_ne!(a.header_value(), b.header_value());
        assert_eq!(a.header_value().len(), 36);
    }

    #[test]
    fn websocket_detection() {
        let ws = Request::builder()
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "WebSocket")
            .body(Body::empty())
            .unwrap();
        assert!(is_websocket_upgrade(&ws));

        let plain = Request::builder()
            .header("connection", "keep-alive")
            .body(Body::empty())
            .unwrap();
        assert!(!is_websocket_upgrade(&plain));
    }
}
