//! Request and response rewriting around the forwarder.
//!
//! # Request
//! 1. Custom rewriter, told whether private APIs are exposed
//! 2. Tracing headers stripped when blocking applies
//! 3. Client forwarding headers dropped unless trusted, then
//!    `X-Forwarded-For` set from the (proxy-protocol aware) client IP
//! 4. A single TLS client certificate passed on as PEM
//! 5. URI pointed at the upstream
//!
//! # Response
//! Security headers, CORS, then the custom rewriter.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::uri::{Authority, Scheme};
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode, Uri};

use crate::http::error::{GatewayError, RequestMeta};
use crate::http::request::{ClientInfo, INTERNAL_WS_MARKER};
use crate::routing::interceptor::BoxError;
use crate::security::cors::CorsPolicy;
use crate::security::headers;

/// Header carrying the client certificate to the upstream.
pub static X_TLS_CLIENT_CERTIFICATE: HeaderName = HeaderName::from_static("x-tls-client-certificate");

/// Custom request hook. The flag tells whether private APIs are exposed.
pub type RequestRewriter = Arc<dyn Fn(&mut Request<Body>, bool) -> Result<(), BoxError> + Send + Sync>;

/// Custom response hook.
pub type ResponseRewriter = Arc<dyn Fn(&mut Response<Body>) -> Result<(), BoxError> + Send + Sync>;

#[derive(Clone)]
pub struct Rewriter {
    custom_request: Option<RequestRewriter>,
    custom_response: Option<ResponseRewriter>,
    private: bool,
    block_tracing: bool,
    trust_forward_header: bool,
    cors: CorsPolicy,
}

impl Rewriter {
    pub fn new(
        custom_request: Option<RequestRewriter>,
        custom_response: Option<ResponseRewriter>,
        private: bool,
        block_tracing: bool,
        trust_forward_header: bool,
        cors: CorsPolicy,
    ) -> Self {
        Self {
            custom_request,
            custom_response,
            private,
            // private deployments see the whole trace
            block_tracing: block_tracing && !private,
            trust_forward_header,
            cors,
        }
    }

    /// Prepare `req` for `scheme://upstream`. WebSocket upgrades keep their
    /// connection headers.
    pub fn rewrite_request(
        &self,
        req: &mut Request<Body>,
        upstream: &str,
        scheme: &str,
        websocket: bool,
    ) -> Result<(), GatewayError> {
        if let Some(custom) = &self.custom_request {
            custom(req, self.private).map_err(|e| {
                tracing::error!(error = %e, "Unable to rewrite request with custom rewriter");
                GatewayError::Internal(format!("unable to rewrite request with custom rewriter: {}", e))
            })?;
        }

        let info = req.extensions().get::<ClientInfo>().cloned();
        let host = req.headers().get(HOST).cloned();
        let headers = req.headers_mut();

        headers.remove(INTERNAL_WS_MARKER);
        if self.block_tracing {
            headers::strip_tracing_headers(headers);
        }
        if !self.trust_forward_header {
            headers::strip_forwarded_for(headers);
        }
        if !websocket {
            headers::strip_hop_by_hop(headers);
        }

        if let Some(info) = info {
            headers::set_forwarded(headers, info.remote_addr.ip(), host, info.tls);

            if let Some(der) = info.peer_certificate.as_deref() {
                headers.append(X_TLS_CLIENT_CERTIFICATE.clone(), certificate_header(der)?);
            }
        }

        // the client sets Host from the new authority
        headers.remove(HOST);

        *req.uri_mut() = upstream_uri(req.uri(), upstream, scheme)?;
        Ok(())
    }

    /// Decorate an upstream response before it reaches the client.
    pub fn rewrite_response(&self, resp: &mut Response<Body>, meta: &RequestMeta) -> Result<(), GatewayError> {
        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            headers::strip_hop_by_hop(resp.headers_mut());
        }
        headers::inject_security_headers(resp.headers_mut());
        self.cors.inject(resp.headers_mut(), &meta.origin, meta.is_preflight());

        if let Some(custom) = &self.custom_response {
            custom(resp).map_err(|e| {
                tracing::error!(error = %e, "Unable to execute response rewriter");
                GatewayError::Internal(format!("unable to execute response rewriter: {}", e))
            })?;
        }
        Ok(())
    }
}

fn certificate_header(der: &[u8]) -> Result<HeaderValue, GatewayError> {
    let block = pem::Pem::new("CERTIFICATE", der.to_vec());
    let encoded = pem::encode_config(&block, pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF));

    HeaderValue::from_str(&encoded.replace('\n', " "))
        .map_err(|e| GatewayError::Internal(format!("unable to handle client TLS certificate: {}", e)))
}

fn upstream_uri(uri: &Uri, upstream: &str, scheme: &str) -> Result<Uri, GatewayError> {
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(
        scheme
            .parse::<Scheme>()
            .map_err(|e| GatewayError::Internal(format!("invalid upstream scheme '{}': {}", scheme, e)))?,
    );
    parts.authority = Some(
        upstream
            .parse::<Authority>()
            .map_err(|e| GatewayError::Internal(format!("invalid upstream address '{}': {}", upstream, e)))?,
    );
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse().map_err(|_| GatewayError::Internal("invalid path".into()))?);
    }

    Uri::from_parts(parts).map_err(|e| GatewayError::Internal(format!("unable to build upstream uri: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use std::net::SocketAddr;

    fn rewriter(private: bool, block_tracing: bool, trust: bool) -> Rewriter {
        Rewriter::new(None, None, private, block_tracing, trust, CorsPolicy::default())
    }

    fn request(info: Option<ClientInfo>) -> Request<Body> {
        let mut req = Request::builder()
            .uri("/v/1/users?q=1")
            .header("host", "api.example")
            .header("x-forwarded-for", "6.6.6.6")
            .header("x-real-ip", "6.6.6.6")
            .header("x-b3-traceid", "abc")
            .header("traceparent", "00-abc")
            .header(INTERNAL_WS_MARKER, "1")
            .header("connection", "close")
            .body(Body::empty())
            .unwrap();
        if let Some(info) = info {
            req.extensions_mut().insert(info);
        }
        req
    }

    fn client() -> ClientInfo {
        ClientInfo::plain("10.1.2.3:5555".parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn rewrites_headers_and_uri() {
        let mut req = request(Some(client()));
        rewriter(false, true, false)
            .rewrite_request(&mut req, "10.0.0.1:443", "https", false)
            .unwrap();

        let h = req.headers();
        assert_eq!(h["x-forwarded-for"], "10.1.2.3");
        assert!(h.get("x-real-ip").is_none());
        assert!(h.get("x-b3-traceid").is_none());
        assert!(h.get("traceparent").is_none());
        assert!(h.get(INTERNAL_WS_MARKER).is_none());
        assert!(h.get("connection").is_none());
        assert!(h.get("host").is_none());
        assert_eq!(h["x-forwarded-host"], "api.example");
        assert_eq!(req.uri().to_string(), "https://10.0.0.1:443/v/1/users?q=1");
    }

    #[test]
    fn private_and_trusted_keep_headers() {
        let mut req = request(Some(client()));
        rewriter(true, true, true)
            .rewrite_request(&mut req, "svc:80", "http", false)
            .unwrap();

        let h = req.headers();
        assert_eq!(h["x-b3-traceid"], "abc");
        assert_eq!(h["x-real-ip"], "6.6.6.6");
        assert_eq!(h["x-forwarded-for"], "6.6.6.6, 10.1.2.3");
    }

    #[test]
    fn websocket_keeps_connection_headers() {
        let mut req = request(Some(client()));
        rewriter(false, false, false)
            .rewrite_request(&mut req, "svc:80", "http", true)
            .unwrap();
        assert_eq!(req.headers()["connection"], "close");
    }

    #[test]
    fn client_certificate_as_single_line_pem() {
        let info = ClientInfo::tls("10.1.2.3:5555".parse().unwrap(), Some(vec![1, 2, 3, 4]));
        let mut req = request(Some(info));
        rewriter(false, false, false)
            .rewrite_request(&mut req, "svc:443", "https", false)
            .unwrap();

        let value = req.headers()[&X_TLS_CLIENT_CERTIFICATE].to_str().unwrap();
        assert!(value.starts_with("-----BEGIN CERTIFICATE----- AQIDBA== -----END CERTIFICATE-----"));
        assert!(!value.contains('\n'));
        assert_eq!(req.headers()["x-forwarded-proto"], "https");
    }

    #[test]
    fn custom_rewriter_errors_surface() {
        let custom: RequestRewriter = Arc::new(|_req: &mut Request<Body>, _private: bool| -> Result<(), BoxError> {
            Err("nope".into())
        });
        let rewriter = Rewriter::new(Some(custom), None, false, false, false, CorsPolicy::default());
        let err = rewriter
            .rewrite_request(&mut request(None), "svc:80", "http", false)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.description().contains("nope"));
    }

    #[test]
    fn invalid_upstream_rejected() {
        let err = rewriter(false, false, false)
            .rewrite_request(&mut request(None), "bad host", "https", false)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn response_gets_security_and_cors_headers() {
        let custom: ResponseRewriter = Arc::new(|resp: &mut Response<Body>| -> Result<(), BoxError> {
            resp.headers_mut().insert("x-custom", HeaderValue::from_static("1"));
            Ok(())
        });
        let rewriter = Rewriter::new(None, Some(custom), false, false, false, CorsPolicy::default());

        let mut resp = Response::new(Body::empty());
        let meta = RequestMeta {
            method: Method::GET,
            origin: "https://app.example".to_string(),
            ..RequestMeta::default()
        };
        rewriter.rewrite_response(&mut resp, &meta).unwrap();

        let h = resp.headers();
        assert_eq!(h["x-frame-options"], "DENY");
        assert_eq!(h["cache-control"], "private, no-transform");
        assert_eq!(h["access-control-allow-origin"], "https://app.example");
        assert_eq!(h["x-custom"], "1");
    }
}
