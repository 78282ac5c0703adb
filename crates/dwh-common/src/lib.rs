//! Goodbooks DWH Common Library
//!
//! Shared pieces used by every warehouse tool in the workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`ConfigError`] for configuration that cannot be trusted
//! - **Environment**: typed readers for environment variables ([`env`])
//! - **Logging**: a single `tracing` initialiser for binaries ([`logging`])
//!
//! # Example
//!
//! ```no_run
//! use dwh_common::env;
//! use dwh_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     let port: u16 = env::parse_or("PG_PORT", 5432)?;
//!     tracing::info!(port, "Configuration loaded");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{ConfigError, ConfigResult};
