//! Client-facing error taxonomy and the single error writer.
//!
//! # Responsibilities
//! - Map pipeline failures (upstream, limiter, body, TLS) to one status
//! - Encode the error list as JSON or MessagePack
//! - Decorate error responses with CORS headers
//!
//! # Design Decisions
//! - Every error body is a list of `{code, description, subject, title}`
//! - The subject is always `gateway`
//! - Encoding follows `Accept`, then `Content-Type`, JSON otherwise

use std::error::Error as StdError;
use std::io;

use axum::body::Body;
use axum::http::header::{ACCEPT, CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use axum::response::IntoResponse;
use serde::Serialize;
use thiserror::Error;

use crate::security::cors::CorsPolicy;

/// Subject attached to every error emitted by the gateway.
pub const ERROR_SUBJECT: &str = "gateway";

/// Largest request body buffered before forwarding.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("The requested service is in maintenance. Please try again in a moment.")]
    Locked,

    #[error("The requested service is not available. Please try again in a moment.")]
    ServiceUnavailable,

    #[error("The requested service took too long to respond. Please try again in a moment.")]
    GatewayTimeout,

    #[error("The requested service is not available. Please try again in a moment.")]
    BadGateway,

    #[error("The client closed the connection before it could complete.")]
    ClientClosed,

    #[error("Please retry in a moment.")]
    RateLimited,

    #[error("Please retry in a moment.")]
    ConnectionLimited,

    #[error("{0}")]
    EntityTooLarge(String),

    #[error("{0}")]
    Tls(String),

    /// Circuit breaker fallback.
    #[error("The service is busy handling requests. Please retry in a moment")]
    Busy,

    #[error("Shutting down. Please retry your request")]
    ShuttingDown,

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Locked => StatusCode::LOCKED,
            GatewayError::ServiceUnavailable | GatewayError::Busy | GatewayError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadGateway => StatusCode::BAD_GATEWAY,
            GatewayError::ClientClosed => status(499),
            GatewayError::RateLimited | GatewayError::ConnectionLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::EntityTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Tls(_) => status(495),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            GatewayError::Locked => "Service Locked",
            GatewayError::ServiceUnavailable => "Service Temporarily Unavailable",
            GatewayError::GatewayTimeout => "Gateway Timeout",
            GatewayError::BadGateway => "Bad Gateway",
            GatewayError::ClientClosed => "Client Closed Connection",
            GatewayError::RateLimited => "Too Many Requests",
            GatewayError::ConnectionLimited => "Too Many Connections",
            GatewayError::EntityTooLarge(_) => "Entity Too Large",
            GatewayError::Tls(_) => "TLS Error",
            GatewayError::Busy => "Service Unavailable",
            GatewayError::ShuttingDown => "Service Not Available",
            GatewayError::Internal(_) => "Internal Server Error",
        }
    }

    pub fn description(&self) -> String {
        self.to_string()
    }

    pub fn body_too_large() -> Self {
        GatewayError::EntityTooLarge(format!(
            "Payload size exceeds the maximum allowed size ({} bytes)",
            MAX_BODY_BYTES
        ))
    }

    /// Classify a forwarding failure by walking its source chain.
    pub fn from_forward_error(err: &(dyn StdError + 'static)) -> Self {
        let mut network = false;
        let mut current = Some(err);

        while let Some(e) = current {
            if e.is::<tower::timeout::error::Elapsed>() || e.is::<tokio::time::error::Elapsed>() {
                return GatewayError::GatewayTimeout;
            }
            if e.is::<http_body_util::LengthLimitError>() {
                return GatewayError::body_too_large();
            }
            if let Some(tls) = e.downcast_ref::<rustls::Error>() {
                if is_certificate_error(tls) {
                    return GatewayError::Tls(tls.to_string());
                }
                network = true;
            }
            if let Some(h) = e.downcast_ref::<hyper::Error>() {
                if h.is_timeout() {
                    return GatewayError::GatewayTimeout;
                }
                if h.is_canceled() {
                    return GatewayError::ClientClosed;
                }
                network = true;
            }
            if e.is::<hyper_util::client::legacy::Error>() {
                network = true;
            }
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                if io_err.kind() == io::ErrorKind::TimedOut {
                    return GatewayError::GatewayTimeout;
                }
                network = true;
                // io::Error::source skips the wrapped error itself
                if let Some(inner) = io_err.get_ref() {
                    current = Some(inner as &(dyn StdError + 'static));
                    continue;
                }
            }
            current = e.source();
        }

        if network {
            GatewayError::BadGateway
        } else {
            GatewayError::Internal(err.to_string())
        }
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn is_certificate_error(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(_)
            | rustls::Error::NoCertificatesPresented
            | rustls::Error::InvalidCertRevocationList(_)
    )
}

/// Wire encoding of error bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Json,
    Msgpack,
}

impl Encoding {
    pub fn negotiate(headers: &HeaderMap) -> Self {
        [ACCEPT, CONTENT_TYPE]
            .iter()
            .filter_map(|name| headers.get(name).and_then(|v| v.to_str().ok()))
            .find_map(Self::from_media_types)
            .unwrap_or_default()
    }

    fn from_media_types(value: &str) -> Option<Self> {
        value
            .split(',')
            .map(|part| part.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .find_map(|media| match media.as_str() {
                "application/msgpack" | "application/x-msgpack" => Some(Encoding::Msgpack),
                "application/json" | "application/*" | "*/*" => Some(Encoding::Json),
                _ => None,
            })
    }

    pub fn content_type(&self) -> HeaderValue {
        match self {
            Encoding::Json => HeaderValue::from_static("application/json; charset=UTF-8"),
            Encoding::Msgpack => HeaderValue::from_static("application/msgpack"),
        }
    }
}

/// The parts of a request needed to answer it with an error after the
/// request itself has been handed off.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub method: Method,
    pub origin: String,
    pub encoding: Encoding,
}

impl RequestMeta {
    pub fn new(method: &Method, headers: &HeaderMap) -> Self {
        Self {
            method: method.clone(),
            origin: headers
                .get(ORIGIN)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            encoding: Encoding::negotiate(headers),
        }
    }

    pub fn is_preflight(&self) -> bool {
        self.method == Method::OPTIONS
    }
}

#[derive(Debug, Serialize)]
struct ErrorEntry<'a> {
    code: u16,
    description: String,
    subject: &'a str,
    title: &'a str,
}

fn encode(err: &GatewayError, encoding: Encoding) -> Result<Vec<u8>, String> {
    let entries = [ErrorEntry {
        code: err.status().as_u16(),
        description: err.description(),
        subject: ERROR_SUBJECT,
        title: err.title(),
    }];

    match encoding {
        Encoding::Json => serde_json::to_vec(&entries).map_err(|e| e.to_string()),
        Encoding::Msgpack => rmp_serde::to_vec_named(&entries).map_err(|e| e.to_string()),
    }
}

/// Render `err` for the client that sent `meta`, CORS included.
pub fn write_error(err: &GatewayError, meta: &RequestMeta, cors: &CorsPolicy) -> Response<Body> {
    let mut response = render(err, meta.encoding);
    cors.inject(response.headers_mut(), &meta.origin, meta.is_preflight());
    response
}

fn render(err: &GatewayError, encoding: Encoding) -> Response<Body> {
    let mut response = match encode(err, encoding) {
        Ok(data) => {
            let mut response = Response::new(Body::from(data));
            response.headers_mut().insert(CONTENT_TYPE, encoding.content_type());
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "Unable to encode error response");
            Response::new(Body::from("Error while encoding the error"))
        }
    };
    *response.status_mut() = err.status();
    response
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        render(&self, Encoding::Json)
    }
}
