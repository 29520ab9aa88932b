//! API gateway data plane with a push-based service registry and a
//! latency-weighted load balancer.
//!
//! ```text
//! client ─▶ net (limits, PROXY, TLS) ─▶ http (pipeline) ─▶ backend
//!                                          │
//!                      routing::Upstreamer ◀── upstreamer ◀── pubsub ◀── notifier
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;

// Service discovery
pub mod pubsub;
pub mod upstreamer;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::GatewayFileConfig;
pub use http::{Gateway, GatewayError, GatewayOptions, RunningGateway};
pub use lifecycle::Shutdown;
pub use routing::{Upstreamer, UpstreamError};
pub use upstreamer::{Notifier, PushUpstreamer};
