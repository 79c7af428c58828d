//! Shared types, config, producer traits, and error definitions for spendscope.

pub mod config;
pub mod error;
pub mod sources;
pub mod types;

pub use config::AuditConfig;
pub use error::Error;
pub use sources::{AuditSource, CostSource, ForecastSource};
pub use types::*;

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
