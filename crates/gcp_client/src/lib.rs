//! Authenticated REST client for Google Cloud APIs.
//!
//! Wraps a bearer access token, a per-client rate limiter and the mapping
//! from HTTP status codes to `common::Error`.

pub mod rate_limit;
pub mod rest;

pub use rate_limit::RateLimiter;
pub use rest::{GcpClient, Paged};
