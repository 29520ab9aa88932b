//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! gateway.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → convert.rs (GatewayOptions, UpstreamerOptions, NotifierOptions)
//!
//! On change:
//!     watcher.rs detects change
//!     → loader.rs loads and validates
//!     → the binary applies the maintenance switch
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Library users skip the file entirely and use the builders

pub mod convert;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::GatewayFileConfig;
