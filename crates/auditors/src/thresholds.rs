//! Monthly cost estimates (USD) behind each recommendation.
//!
//! Rough list-price figures; savings are estimates, not invoices.

pub const COMPUTE_STOPPED_DISK_COST: f64 = 20.0;
pub const COMPUTE_PREEMPTIBLE_SAVINGS: f64 = 100.0;

pub const CLOUD_RUN_CPU_ALWAYS_ALLOCATED: f64 = 30.0;
pub const CLOUD_RUN_PER_MIN_INSTANCE: f64 = 40.0;

pub const CLOUD_FUNCTION_PER_MIN_INSTANCE: f64 = 8.0;
pub const CLOUD_FUNCTION_FAILED: f64 = 5.0;
pub const CLOUD_FUNCTION_MEMORY_OPTIMIZATION: f64 = 8.0;

pub const CLOUD_SQL_STOPPED: f64 = 50.0;

pub const DISK_PER_GB_MONTHLY: f64 = 0.04;
pub const STATIC_IP_EXTERNAL_MONTHLY: f64 = 7.0;

/// Function memory above this is flagged for right-sizing.
pub const FUNCTION_MEMORY_CEILING_MB: u64 = 1024;
