//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (hyper-util connection, request ID, tracing)
//!     → handler.rs (preflight, maintenance, interceptors, upstream choice)
//!     → chain.rs (breaker, limits, buffering) or straight to forwarder.rs
//!     → rewrite.rs (forwarding headers in, security headers out)
//!     → forwarder.rs (pooled upstream client, WebSocket tunnel)
//!     → error.rs on any failure (JSON or MessagePack error body)
//! ```

pub mod chain;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod options;
pub mod request;
pub mod rewrite;
pub mod server;

pub use error::GatewayError;
pub use options::GatewayOptions;
pub use request::{ClientInfo, X_REQUEST_ID};
pub use server::{Gateway, RunningGateway, ServerError};
