//! Snapshot aggregation: fan-out over producers, merge, and versioned cache.

pub mod cache;
pub mod combiner;
pub mod fingerprint;
pub mod orchestrator;
pub mod provider;

pub use cache::{CacheWrite, RejectReason, SnapshotCache};
pub use combiner::{combine, BillingGroup, MultiProjectView, ProjectEntry};
pub use fingerprint::{fingerprint, ConfigFingerprint};
pub use orchestrator::{
    AuditorRegistry, ForecastWindow, Orchestrator, OrchestratorSettings, ProducerTimeouts,
    RunOptions,
};
pub use provider::{spawn_invalidation_listener, ConfigProvider};
