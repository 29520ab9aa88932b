//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → main stops the gateway, then notifiers, then the upstreamer
//!
//! Shutdown (shutdown.rs):
//!     trigger() → accept loops exit → connections drain → tasks return
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_shutdown_signal;
