//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to upstream:
//!     → circuit_breaker.rs (admit, or answer with the fallback)
//!     → forward
//!     → circuit_breaker.rs (record status and latency)
//!     → condition.rs (evaluate the trip expression over the window)
//! ```
//!
//! # Design Decisions
//! - The trip condition is an expression parsed once at construction
//! - Circuit breaker prevents cascading failures

pub mod circuit_breaker;
pub mod condition;
