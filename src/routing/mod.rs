//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (path)
//!     → interceptor.rs (exact, prefix, suffix tiers)
//!     → matcher.rs (evaluate path conditions)
//!     → Return: interception, or fall through
//!
//! Fall through:
//!     → upstream.rs (Upstreamer resolves the backend address)
//! ```
//!
//! # Design Decisions
//! - Interceptors registered at startup, immutable at runtime
//! - No regex in hot path
//! - Deterministic: same path always hits the same interceptor
//! - First match wins

pub mod interceptor;
pub mod matcher;
pub mod upstream;

pub use interceptor::{interceptor, Interception, InterceptorAction, InterceptorFn, Interceptors};
pub use upstream::{LatencyCollector, StaticUpstreamer, UpstreamError, Upstreamer};
