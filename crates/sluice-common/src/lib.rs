//! Sluice Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the Sluice workspace.
//!
//! - **Error Handling**: [`SluiceError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use sluice_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("ingest worker started");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{Result, SluiceError};
