//! Versioned in-memory snapshot cache.
//!
//! One `DashMap` slot per fingerprint holds the generation counters and the
//! live entry. Every per-fingerprint read-modify-write happens under that
//! slot's shard lock, so a stale writer can never overwrite a newer entry.

use std::sync::Arc;
use std::time::Duration;

use common::{ForecastData, Snapshot};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::fingerprint::ConfigFingerprint;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: Arc<T>,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: Arc<T>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
struct Slot {
    /// Last generation handed out by `reserve_generation`.
    issued: u64,
    /// Highest generation ever stored.
    high_water: u64,
    /// Generations at or below this were issued before an invalidation.
    floor: u64,
    /// Bumped by every invalidation; forecast writes compare against it.
    epoch: u64,
    entry: Option<CacheEntry<Snapshot>>,
    /// Newest snapshot handed to any caller, cached or not. Survives
    /// invalidation and expiry so readers never see a generation go back.
    newest: Option<Arc<Snapshot>>,
}

impl Slot {
    fn live(&mut self) -> Option<Arc<Snapshot>> {
        if self.entry.as_ref().is_some_and(|entry| !entry.is_live()) {
            self.entry = None;
        }
        self.entry.as_ref().map(|entry| entry.value.clone())
    }

    fn newest_generation(&self) -> u64 {
        self.newest.as_ref().map(|s| s.generation_id).unwrap_or(0)
    }

    fn hand_out(&mut self, snapshot: &Arc<Snapshot>) {
        if snapshot.generation_id > self.newest_generation() {
            self.newest = Some(snapshot.clone());
        }
    }

    fn invalidate(&mut self) {
        self.floor = self.issued;
        self.epoch += 1;
        self.entry = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A newer generation has already been stored.
    Superseded { stored: u64 },
    /// The run started before the fingerprint was invalidated.
    Invalidated { floor: u64 },
}

#[derive(Debug, Clone)]
pub enum CacheWrite {
    Stored(Arc<Snapshot>),
    /// Lost to the live entry, which is returned instead.
    Superseded {
        reason: RejectReason,
        current: Arc<Snapshot>,
    },
    /// Not cached, but no caller has seen a newer generation.
    Uncached {
        reason: RejectReason,
        snapshot: Arc<Snapshot>,
    },
    /// Not cached, and older than a snapshot already handed out.
    Stale {
        reason: RejectReason,
        newest: Arc<Snapshot>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ForecastKey {
    fingerprint: ConfigFingerprint,
    days: u32,
    historical_days: u32,
}

#[derive(Debug, Default)]
pub struct SnapshotCache {
    slots: DashMap<ConfigFingerprint, Slot>,
    forecasts: DashMap<ForecastKey, CacheEntry<ForecastData>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live snapshot for `fp`. Expired entries are evicted here.
    pub fn get(&self, fp: &ConfigFingerprint) -> Option<Arc<Snapshot>> {
        self.slots.get_mut(fp).and_then(|mut slot| slot.live())
    }

    pub fn reserve_generation(&self, fp: &ConfigFingerprint) -> u64 {
        let mut slot = self.slots.entry(fp.clone()).or_default();
        slot.issued += 1;
        slot.issued
    }

    /// Highest generation stored so far for `fp`; zero if none.
    pub fn high_water(&self, fp: &ConfigFingerprint) -> u64 {
        self.slots.get(fp).map(|slot| slot.high_water).unwrap_or(0)
    }

    /// Invalidation epoch for `fp`, captured before a forecast fetch.
    pub fn epoch(&self, fp: &ConfigFingerprint) -> u64 {
        self.slots.entry(fp.clone()).or_default().epoch
    }

    /// Store `snapshot` under its `generation_id` unless a newer generation
    /// or an invalidation got there first.
    pub fn put(&self, fp: &ConfigFingerprint, snapshot: Arc<Snapshot>, ttl: Duration) -> CacheWrite {
        let generation = snapshot.generation_id;
        self.put_with(fp, generation, ttl, |_| snapshot)
    }

    /// Build the snapshot for `generation` from the live entry and store it,
    /// all under the slot lock. `build` must set `generation_id`.
    pub fn put_with<B>(
        &self,
        fp: &ConfigFingerprint,
        generation: u64,
        ttl: Duration,
        build: B,
    ) -> CacheWrite
    where
        B: FnOnce(Option<Arc<Snapshot>>) -> Arc<Snapshot>,
    {
        let mut slot = self.slots.entry(fp.clone()).or_default();
        let live = slot.live();
        let snapshot = build(live.clone());

        let reason = if generation <= slot.floor {
            Some(RejectReason::Invalidated { floor: slot.floor })
        } else if generation < slot.high_water {
            Some(RejectReason::Superseded {
                stored: slot.high_water,
            })
        } else {
            None
        };

        let Some(reason) = reason else {
            slot.high_water = generation;
            slot.entry = Some(CacheEntry::new(snapshot.clone(), ttl));
            slot.hand_out(&snapshot);
            debug!("Cached snapshot for {} gen={} ttl={:?}", fp, generation, ttl);
            return CacheWrite::Stored(snapshot);
        };

        debug!("Cache write for {} gen={} rejected: {:?}", fp, generation, reason);
        if let Some(current) = live {
            return CacheWrite::Superseded { reason, current };
        }
        match slot.newest.clone() {
            Some(newest) if newest.generation_id > generation => {
                CacheWrite::Stale { reason, newest }
            }
            _ => {
                slot.hand_out(&snapshot);
                CacheWrite::Uncached { reason, snapshot }
            }
        }
    }

    /// Drop the entry and forecasts for `fp`. Runs already in flight for
    /// `fp` can no longer store their results.
    pub fn invalidate(&self, fp: &ConfigFingerprint) {
        if let Some(mut slot) = self.slots.get_mut(fp) {
            slot.invalidate();
        }
        self.forecasts.retain(|key, _| key.fingerprint != *fp);
        debug!("Invalidated cache for {}", fp);
    }

    pub fn invalidate_all(&self) {
        for mut slot in self.slots.iter_mut() {
            slot.invalidate();
        }
        self.forecasts.clear();
        debug!("Invalidated all cached snapshots");
    }

    pub fn get_forecast(
        &self,
        fp: &ConfigFingerprint,
        days: u32,
        historical_days: u32,
    ) -> Option<Arc<ForecastData>> {
        let key = ForecastKey {
            fingerprint: fp.clone(),
            days,
            historical_days,
        };
        let live = self
            .forecasts
            .get(&key)
            .map(|entry| entry.is_live().then(|| entry.value.clone()))?;
        if live.is_none() {
            self.forecasts.remove_if(&key, |_, entry| !entry.is_live());
        }
        live
    }

    /// Store a forecast fetched under invalidation `epoch`. Returns false
    /// when the fingerprint was invalidated after the fetch started.
    pub fn put_forecast(
        &self,
        fp: &ConfigFingerprint,
        days: u32,
        historical_days: u32,
        forecast: Arc<ForecastData>,
        epoch: u64,
        ttl: Duration,
    ) -> bool {
        // Held across the insert so an invalidation cannot slip in between.
        let slot = self.slots.entry(fp.clone()).or_default();
        if slot.epoch != epoch {
            debug!("Forecast for {} dropped after invalidation", fp);
            return false;
        }
        let key = ForecastKey {
            fingerprint: fp.clone(),
            days,
            historical_days,
        };
        self.forecasts.insert(key, CacheEntry::new(forecast, ttl));
        drop(slot);
        true
    }

    /// Number of fingerprints with a live snapshot.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.entry.as_ref().is_some_and(CacheEntry::is_live))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{AuditConfig, CostFigures, CostTrend};
    use std::collections::BTreeMap;

    use crate::fingerprint::fingerprint;

    const TTL: Duration = Duration::from_secs(300);

    fn fp(project: &str) -> ConfigFingerprint {
        fingerprint(&AuditConfig::for_project(project, "billing.export"))
    }

    fn snapshot(project: &str, generation: u64) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            project_id: project.to_string(),
            billing_month: "2026-10".to_string(),
            cost: CostFigures::default(),
            audits: BTreeMap::new(),
            recommendations: Vec::new(),
            total_potential_savings: 0.0,
            forecast: None,
            forecast_error: None,
            created_at: Utc::now(),
            generation_id: generation,
            degraded: false,
        })
    }

    fn forecast() -> Arc<ForecastData> {
        Arc::new(ForecastData {
            points: Vec::new(),
            total_predicted_cost: 42.0,
            forecast_days: 30,
            historical_days: 90,
            model_confidence: 0.9,
            trend: CostTrend::Stable,
            generated_at: Utc::now(),
        })
    }

    #[test]
    fn test_generations_are_monotonic_per_fingerprint() {
        let cache = SnapshotCache::new();
        assert_eq!(cache.reserve_generation(&fp("a")), 1);
        assert_eq!(cache.reserve_generation(&fp("a")), 2);
        assert_eq!(cache.reserve_generation(&fp("b")), 1);
    }

    #[tokio::test]
    async fn test_older_generation_cannot_overwrite_newer() {
        let cache = SnapshotCache::new();
        let key = fp("a");
        let g1 = cache.reserve_generation(&key);
        let g2 = cache.reserve_generation(&key);

        assert!(matches!(cache.put(&key, snapshot("a", g2), TTL), CacheWrite::Stored(_)));
        match cache.put(&key, snapshot("a", g1), TTL) {
            CacheWrite::Superseded { reason, current } => {
                assert_eq!(reason, RejectReason::Superseded { stored: g2 });
                assert_eq!(current.generation_id, g2);
            }
            other => panic!("stale generation was not superseded: {other:?}"),
        }
        assert_eq!(cache.get(&key).map(|s| s.generation_id), Some(g2));
        assert_eq!(cache.high_water(&key), g2);
    }

    #[tokio::test]
    async fn test_invalidation_blocks_in_flight_runs() {
        let cache = SnapshotCache::new();
        let key = fp("a");
        let in_flight = cache.reserve_generation(&key);
        cache.invalidate(&key);

        assert!(matches!(
            cache.put(&key, snapshot("a", in_flight), TTL),
            CacheWrite::Uncached {
                reason: RejectReason::Invalidated { .. },
                ..
            }
        ));
        assert!(cache.get(&key).is_none());

        let fresh = cache.reserve_generation(&key);
        assert!(fresh > in_flight);
        assert!(matches!(cache.put(&key, snapshot("a", fresh), TTL), CacheWrite::Stored(_)));
    }

    #[tokio::test]
    async fn test_rejected_write_older_than_served_snapshot_goes_stale() {
        let cache = SnapshotCache::new();
        let key = fp("a");
        let older = cache.reserve_generation(&key);
        let newer = cache.reserve_generation(&key);
        assert!(matches!(cache.put(&key, snapshot("a", newer), TTL), CacheWrite::Stored(_)));
        cache.invalidate(&key);

        match cache.put(&key, snapshot("a", older), TTL) {
            CacheWrite::Stale { reason, newest } => {
                assert_eq!(reason, RejectReason::Invalidated { floor: newer });
                assert_eq!(newest.generation_id, newer);
            }
            other => panic!("expected a stale write, got {other:?}"),
        }
        assert!(cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_put_with_builds_on_the_live_entry() {
        let cache = SnapshotCache::new();
        let key = fp("a");
        let first = cache.reserve_generation(&key);
        cache.put(&key, snapshot("a", first), TTL);

        let second = cache.reserve_generation(&key);
        let write = cache.put_with(&key, second, TTL, |live| {
            let base = live.expect("live entry is passed to the builder");
            assert_eq!(base.generation_id, first);
            let mut next = Snapshot::clone(&base);
            next.generation_id = second;
            Arc::new(next)
        });
        assert!(matches!(write, CacheWrite::Stored(ref s) if s.generation_id == second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = SnapshotCache::new();
        let key = fp("a");
        let generation = cache.reserve_generation(&key);
        cache.put(&key, snapshot("a", generation), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get(&key).is_some());
        assert_eq!(cache.live_count(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.live_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_all_clears_every_fingerprint() {
        let cache = SnapshotCache::new();
        for project in ["a", "b"] {
            let key = fp(project);
            let generation = cache.reserve_generation(&key);
            cache.put(&key, snapshot(project, generation), TTL);
            let epoch = cache.epoch(&key);
            cache.put_forecast(&key, 30, 90, forecast(), epoch, TTL);
        }
        cache.invalidate_all();
        assert!(cache.get(&fp("a")).is_none());
        assert!(cache.get(&fp("b")).is_none());
        assert!(cache.get_forecast(&fp("a"), 30, 90).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forecast_class_has_its_own_ttl() {
        let cache = SnapshotCache::new();
        let key = fp("a");
        let generation = cache.reserve_generation(&key);
        cache.put(&key, snapshot("a", generation), Duration::from_secs(60));
        let epoch = cache.epoch(&key);
        assert!(cache.put_forecast(&key, 30, 90, forecast(), epoch, Duration::from_secs(600)));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(cache.get(&key).is_none());
        assert!(cache.get_forecast(&key, 30, 90).is_some());
        assert!(cache.get_forecast(&key, 60, 90).is_none());

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(cache.get_forecast(&key, 30, 90).is_none());
    }

    #[tokio::test]
    async fn test_invalidated_forecast_write_is_dropped() {
        let cache = SnapshotCache::new();
        let key = fp("a");
        let epoch = cache.epoch(&key);
        cache.invalidate(&key);
        assert!(!cache.put_forecast(&key, 30, 90, forecast(), epoch, TTL));
        assert!(cache.get_forecast(&key, 30, 90).is_none());
    }

    #[tokio::test]
    async fn test_forecast_writes_do_not_consume_generations() {
        let cache = SnapshotCache::new();
        let key = fp("a");
        let epoch = cache.epoch(&key);
        assert!(cache.put_forecast(&key, 30, 90, forecast(), epoch, TTL));
        assert_eq!(cache.reserve_generation(&key), 1);
    }
}
