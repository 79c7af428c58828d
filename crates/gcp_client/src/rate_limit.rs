//! Request rate limiter for GCP APIs.
//!
//! Most inventory APIs allow a few hundred reads per minute per project; the
//! default keeps well under that.

use governor::{Quota, RateLimiter as GovLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

type DirectLimiter = GovLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Single-bucket limiter shared by clones of one client.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limiter: Arc<DirectLimiter>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::per_second(10)
    }

    /// Zero is treated as one request per second.
    pub fn per_second(requests: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: Arc::new(GovLimiter::direct(quota)),
        }
    }

    /// Take a request slot, waiting for one if the burst is spent.
    /// Returns true when the caller was throttled.
    pub async fn acquire(&self, what: &str) -> bool {
        if self.try_acquire() {
            return false;
        }
        debug!("Rate limit reached; {} waits for a slot", what);
        self.limiter.until_ready().await;
        true
    }

    fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
