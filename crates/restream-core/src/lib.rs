//! restream Core Library
//!
//! Shared functionality for restream components:
//! - Configuration model and hierarchical resolution
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
