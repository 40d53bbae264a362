//! Nutri Common Library
//!
//! Shared plumbing for the nutrition ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Environment**: `.env` loading and typed environment lookups
//! - **Logging**: `tracing` subscriber setup for console and rolling files
//!
//! # Example
//!
//! ```no_run
//! use nutri_common::{env, logging::{init_logging, LogConfig}};
//!
//! fn main() -> nutri_common::Result<()> {
//!     env::load_dotenv();
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let port: u16 = env::parse_var("DB_PORT", 5432)?;
//!     tracing::info!(port, "configured");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod env;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
