//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted request:
//!     → rate_limit.rs (per-source token buckets)
//!     → qos.rs (per-source in-flight connections)
//!     → headers.rs (sanitize, add X-Forwarded-*)
//!     → Forward upstream
//! Response:
//!     → headers.rs (security headers)
//!     → cors.rs (allowed origin policy)
//! ```
//!
//! # Design Decisions
//! - Fail closed: extractor failures deny the request
//! - No trust in client forwarding headers unless configured

pub mod cors;
pub mod extractors;
pub mod headers;
pub mod qos;
pub mod rate_limit;
pub mod token_bucket;
