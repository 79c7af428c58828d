//! Fan-out over every producer and merge into a versioned snapshot.
//!
//! A run validates the config, reserves a generation for its fingerprint,
//! spawns one task per producer (each under its own timeout), and writes
//! the merged snapshot through the cache. Producer failures never fail the
//! run; they are recorded as markers on the snapshot.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::config::{AppConfig, TimeoutConfig};
use common::{
    sort_for_display, total_savings, AuditConfig, AuditKind, AuditOutcome, AuditReport,
    AuditSource, CostFigures, CostSource, Error, ForecastData, ForecastSource, ProducerError,
    ProducerKind, Result, Snapshot,
};
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheWrite, SnapshotCache};
use crate::combiner::{combine, MultiProjectView, ProjectEntry};
use crate::fingerprint::{fingerprint, ConfigFingerprint};

/// Reruns allowed when a run finishes behind a snapshot already served.
const MAX_STALE_RERUNS: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerTimeouts {
    pub cost: Duration,
    pub forecast: Duration,
    /// Applies to every audit kind without an override.
    pub audit: Duration,
    pub per_audit: BTreeMap<AuditKind, Duration>,
}

impl ProducerTimeouts {
    pub fn audit(&self, kind: AuditKind) -> Duration {
        self.per_audit.get(&kind).copied().unwrap_or(self.audit)
    }
}

impl From<&TimeoutConfig> for ProducerTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            cost: Duration::from_secs(config.cost_secs),
            forecast: Duration::from_secs(config.forecast_secs),
            audit: Duration::from_secs(config.audit_secs),
            per_audit: AuditKind::ALL
                .iter()
                .filter(|kind| config.per_audit.contains_key(*kind))
                .map(|kind| (*kind, config.audit_timeout(*kind)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForecastWindow {
    pub days: u32,
    pub historical_days: u32,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub snapshot_ttl: Duration,
    pub forecast_ttl: Duration,
    pub timeouts: ProducerTimeouts,
    pub forecast_window: ForecastWindow,
    /// Include a forecast in every full snapshot run.
    pub forecast_in_snapshot: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            snapshot_ttl: Duration::from_secs(config.cache.snapshot_ttl_secs),
            forecast_ttl: Duration::from_secs(config.cache.forecast_ttl_secs),
            timeouts: ProducerTimeouts::from(&config.timeouts),
            forecast_window: ForecastWindow {
                days: config.forecast.days,
                historical_days: config.forecast.historical_days,
            },
            forecast_in_snapshot: config.forecast.enabled,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip the cache lookup; the result is still written through.
    pub force_refresh: bool,
    /// Refresh only these producers on top of the cached snapshot.
    pub only: BTreeSet<ProducerKind>,
}

impl RunOptions {
    pub fn forced() -> Self {
        Self {
            force_refresh: true,
            only: BTreeSet::new(),
        }
    }

    pub fn only(kinds: impl IntoIterator<Item = ProducerKind>) -> Self {
        Self {
            force_refresh: true,
            only: kinds.into_iter().collect(),
        }
    }
}

/// Auditors keyed by the kind they report.
#[derive(Debug)]
pub struct AuditorRegistry<A> {
    auditors: BTreeMap<AuditKind, Arc<A>>,
}

impl<A: AuditSource> AuditorRegistry<A> {
    /// A later auditor for the same kind replaces an earlier one.
    pub fn new(auditors: impl IntoIterator<Item = A>) -> Self {
        Self {
            auditors: auditors
                .into_iter()
                .map(|auditor| (auditor.kind(), Arc::new(auditor)))
                .collect(),
        }
    }

    pub fn get(&self, kind: AuditKind) -> Option<&Arc<A>> {
        self.auditors.get(&kind)
    }

    pub fn contains(&self, kind: AuditKind) -> bool {
        self.auditors.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<AuditKind> {
        self.auditors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.auditors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.auditors.is_empty()
    }
}

/// What one producer task hands back.
enum Finished {
    Cost(std::result::Result<CostFigures, ProducerError>),
    Audit(AuditKind, std::result::Result<AuditReport, ProducerError>),
    Forecast(std::result::Result<ForecastData, ProducerError>),
}

impl Finished {
    fn producer(&self) -> ProducerKind {
        match self {
            Finished::Cost(_) => ProducerKind::Cost,
            Finished::Audit(kind, _) => ProducerKind::Audit(*kind),
            Finished::Forecast(_) => ProducerKind::Forecast,
        }
    }

    fn lost(producer: ProducerKind) -> Self {
        let error = ProducerError::failure(producer, "task did not complete");
        match producer {
            ProducerKind::Cost => Finished::Cost(Err(error)),
            ProducerKind::Audit(kind) => Finished::Audit(kind, Err(error)),
            ProducerKind::Forecast => Finished::Forecast(Err(error)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// Await one producer under `limit`, turning errors, timeouts and panics
/// into a marker for `producer`.
async fn guarded<T, Fut>(
    producer: ProducerKind,
    limit: Duration,
    fut: Fut,
) -> std::result::Result<T, ProducerError>
where
    Fut: Future<Output = Result<T>>,
{
    let result = match tokio::time::timeout(limit, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(Ok(value))) => return Ok(value),
        Ok(Ok(Err(e))) => ProducerError::failure(producer, e),
        Ok(Err(panic)) => ProducerError::failure(producer, panic_message(panic.as_ref())),
        Err(_) => ProducerError::timeout(producer, limit),
    };
    warn!("{}", result.message);
    Err(result)
}

pub struct Orchestrator<C, A, F> {
    cost: Arc<C>,
    auditors: AuditorRegistry<A>,
    forecaster: Arc<F>,
    cache: Arc<SnapshotCache>,
    settings: OrchestratorSettings,
}

impl<C, A, F> Orchestrator<C, A, F>
where
    C: CostSource,
    A: AuditSource,
    F: ForecastSource,
{
    pub fn new(
        cost: C,
        auditors: AuditorRegistry<A>,
        forecaster: F,
        cache: Arc<SnapshotCache>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            cost: Arc::new(cost),
            auditors,
            forecaster: Arc::new(forecaster),
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registered_kinds(&self) -> Vec<AuditKind> {
        self.auditors.kinds()
    }

    /// Cached snapshot when live, otherwise a fresh run.
    pub async fn get_snapshot(
        &self,
        config: &AuditConfig,
        force_refresh: bool,
    ) -> Result<Arc<Snapshot>> {
        let options = if force_refresh {
            RunOptions::forced()
        } else {
            RunOptions::default()
        };
        self.run(config, options).await
    }

    /// Outcome of a single audit kind. A forced call reruns only that
    /// auditor on top of the cached snapshot.
    pub async fn get_snapshot_for_audit(
        &self,
        config: &AuditConfig,
        kind: AuditKind,
        force_refresh: bool,
    ) -> Result<AuditOutcome> {
        config.validate()?;
        if !self.auditors.contains(kind) {
            return Err(Error::UnknownAuditKind(kind.to_string()));
        }

        let options = if force_refresh {
            RunOptions::only([ProducerKind::Audit(kind)])
        } else {
            RunOptions::default()
        };
        let snapshot = self.run(config, options).await?;
        snapshot
            .audit(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownAuditKind(kind.to_string()))
    }

    /// Snapshots for several projects, fetched concurrently. Every config is
    /// validated before any producer is called.
    pub async fn get_multi_project_view(
        &self,
        configs: &[AuditConfig],
        group_by_billing_account: bool,
    ) -> Result<MultiProjectView> {
        for (idx, config) in configs.iter().enumerate() {
            config.validate().map_err(|e| match e {
                Error::ConfigurationInvalid(msg) => {
                    Error::ConfigurationInvalid(format!("projects[{idx}]: {msg}"))
                }
                other => other,
            })?;
        }

        let entries = futures::future::try_join_all(
            configs
                .iter()
                .map(|config| self.project_entry(config, group_by_billing_account)),
        )
        .await?;

        let view = combine(entries, group_by_billing_account);
        info!(
            "Multi-project view: {} project(s), {} group(s), cost={:.2}",
            view.projects.len(),
            view.groups.len(),
            view.total_current_month_cost
        );
        Ok(view)
    }

    async fn project_entry(
        &self,
        config: &AuditConfig,
        resolve_account: bool,
    ) -> Result<ProjectEntry> {
        let (snapshot, billing_account_id) = tokio::join!(
            self.get_snapshot(config, false),
            self.billing_account(config, resolve_account)
        );
        Ok(ProjectEntry {
            project_id: config.project_id().to_string(),
            billing_account_id,
            snapshot: snapshot?,
        })
    }

    /// Billing account `config` is charged to, looked up when not configured.
    pub async fn resolve_billing_account(&self, config: &AuditConfig) -> Result<Option<String>> {
        config.validate()?;
        Ok(self.billing_account(config, true).await)
    }

    /// Configured account first; otherwise ask the cost source. A failed
    /// lookup leaves the project ungrouped.
    async fn billing_account(&self, config: &AuditConfig, lookup: bool) -> Option<String> {
        let configured = config
            .billing_account_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if let Some(id) = configured {
            return Some(id.to_string());
        }
        if !lookup {
            return None;
        }

        let project_id = config.project_id();
        let limit = self.settings.timeouts.cost;
        match tokio::time::timeout(limit, self.cost.billing_account(project_id)).await {
            Ok(Ok(account)) => account,
            Ok(Err(e)) => {
                warn!("Billing account lookup failed for {}: {}", project_id, e);
                None
            }
            Err(_) => {
                warn!("Billing account lookup timed out for {}", project_id);
                None
            }
        }
    }

    /// Forecast from its own cache class. Errors surface directly here since
    /// there is no snapshot to attach a marker to.
    pub async fn get_forecast(
        &self,
        config: &AuditConfig,
        force_refresh: bool,
    ) -> Result<Arc<ForecastData>> {
        config.validate()?;
        let fp = fingerprint(config);
        let window = self.settings.forecast_window;

        if !force_refresh {
            if let Some(hit) = self
                .cache
                .get_forecast(&fp, window.days, window.historical_days)
            {
                debug!("Forecast cache hit for {}", fp);
                return Ok(hit);
            }
        }

        let epoch = self.cache.epoch(&fp);
        let limit = self.settings.timeouts.forecast;
        let scope = config.billing_scope();
        let fetch = self
            .forecaster
            .fetch(&scope, window.days, window.historical_days);
        let forecast = match tokio::time::timeout(limit, fetch).await {
            Ok(result) => Arc::new(result?),
            Err(_) => {
                return Err(Error::ProducerTimeout {
                    producer: ProducerKind::Forecast.to_string(),
                    after_ms: limit.as_millis() as u64,
                })
            }
        };

        self.cache.put_forecast(
            &fp,
            window.days,
            window.historical_days,
            forecast.clone(),
            epoch,
            self.settings.forecast_ttl,
        );
        Ok(forecast)
    }

    pub fn invalidate_cache(&self, config: &AuditConfig) {
        let fp = fingerprint(config);
        info!("Invalidating cached snapshot for {}", fp);
        self.cache.invalidate(&fp);
    }

    pub fn invalidate_all(&self) {
        info!("Invalidating every cached snapshot");
        self.cache.invalidate_all();
    }

    /// Build (or reuse) the snapshot for `config`.
    pub async fn run(&self, config: &AuditConfig, options: RunOptions) -> Result<Arc<Snapshot>> {
        config.validate()?;
        for producer in &options.only {
            if let ProducerKind::Audit(kind) = producer {
                if !self.auditors.contains(*kind) {
                    return Err(Error::UnknownAuditKind(kind.to_string()));
                }
            }
        }

        let fp = fingerprint(config);
        if !options.force_refresh && options.only.is_empty() {
            if let Some(hit) = self.cache.get(&fp) {
                debug!("Cache hit for {} gen={}", fp, hit.generation_id);
                return Ok(hit);
            }
        }

        let mut reruns = 0;
        loop {
            let newest = match self.run_once(config, &options, &fp).await {
                CacheWrite::Stored(snapshot)
                | CacheWrite::Superseded {
                    current: snapshot, ..
                }
                | CacheWrite::Uncached { snapshot, .. } => return Ok(snapshot),
                CacheWrite::Stale { newest, .. } => newest,
            };
            if reruns >= MAX_STALE_RERUNS {
                debug!("Serving gen={} for {} after a stale rerun", newest.generation_id, fp);
                return Ok(newest);
            }
            reruns += 1;
            info!(
                "Run for {} finished behind gen={} after an invalidation; rerunning",
                fp, newest.generation_id
            );
        }
    }

    /// One fan-out and cache write under a freshly reserved generation.
    async fn run_once(
        &self,
        config: &AuditConfig,
        options: &RunOptions,
        fp: &ConfigFingerprint,
    ) -> CacheWrite {
        let base = if options.only.is_empty() {
            None
        } else {
            self.cache.get(fp)
        };
        let mut targets = match &base {
            Some(_) => options.only.clone(),
            None => {
                if !options.only.is_empty() {
                    debug!("No live snapshot for {}; widening to a full refresh", fp);
                }
                self.full_targets()
            }
        };

        // A full run reuses a live forecast; an explicit request refetches.
        let window = self.settings.forecast_window;
        let mut cached_forecast = None;
        if base.is_none() && targets.contains(&ProducerKind::Forecast) {
            cached_forecast = self
                .cache
                .get_forecast(fp, window.days, window.historical_days);
            if cached_forecast.is_some() {
                targets.remove(&ProducerKind::Forecast);
            }
        }

        let generation = self.cache.reserve_generation(fp);
        let epoch = self.cache.epoch(fp);
        info!(
            "Refreshing {} gen={} producers={}",
            fp,
            generation,
            targets.len()
        );
        let started = Instant::now();
        let finished = self.fan_out(config, &targets).await;

        // Partial runs apply their outcomes to whatever is live at write
        // time, so a full refresh that landed meanwhile is kept.
        let mut fresh_forecast = None;
        let write = self
            .cache
            .put_with(fp, generation, self.settings.snapshot_ttl, |live| {
                let base = match (base, live) {
                    (Some(base), Some(live)) if live.generation_id > base.generation_id => {
                        debug!(
                            "Rebasing gen={} for {} on gen={}",
                            generation, fp, live.generation_id
                        );
                        Some(live)
                    }
                    (base, _) => base,
                };
                let mut snapshot = match base {
                    Some(base) => Snapshot::clone(&base),
                    None => Snapshot {
                        project_id: config.project_id().to_string(),
                        billing_month: String::new(),
                        cost: CostFigures::default(),
                        audits: BTreeMap::new(),
                        recommendations: Vec::new(),
                        total_potential_savings: 0.0,
                        forecast: cached_forecast.as_deref().cloned(),
                        forecast_error: None,
                        created_at: Utc::now(),
                        generation_id: 0,
                        degraded: false,
                    },
                };
                fresh_forecast = merge(&mut snapshot, finished, generation);
                Arc::new(snapshot)
            });

        if let Some(forecast) = fresh_forecast {
            self.cache.put_forecast(
                fp,
                window.days,
                window.historical_days,
                Arc::new(forecast),
                epoch,
                self.settings.forecast_ttl,
            );
        }

        match &write {
            CacheWrite::Stored(snapshot) => info!(
                "Snapshot for {} gen={} ready in {:?}: cost={:.2}, {} recommendation(s), savings={:.2}{}",
                fp,
                generation,
                started.elapsed(),
                snapshot.cost.current_month_cost,
                snapshot.recommendations.len(),
                snapshot.total_potential_savings,
                if snapshot.degraded { " (degraded)" } else { "" }
            ),
            CacheWrite::Superseded { reason, current } => debug!(
                "Run gen={} for {} lost to gen={} ({:?})",
                generation, fp, current.generation_id, reason
            ),
            CacheWrite::Uncached { reason, .. } => {
                debug!("Run gen={} for {} not cached ({:?})", generation, fp, reason)
            }
            CacheWrite::Stale { reason, newest } => debug!(
                "Run gen={} for {} is behind served gen={} ({:?})",
                generation, fp, newest.generation_id, reason
            ),
        }
        write
    }

    fn full_targets(&self) -> BTreeSet<ProducerKind> {
        let mut targets: BTreeSet<ProducerKind> = self
            .auditors
            .kinds()
            .into_iter()
            .map(ProducerKind::Audit)
            .collect();
        targets.insert(ProducerKind::Cost);
        if self.settings.forecast_in_snapshot {
            targets.insert(ProducerKind::Forecast);
        }
        targets
    }

    /// One task per target; the run's latency is bounded by the slowest
    /// timeout rather than the sum.
    async fn fan_out(
        &self,
        config: &AuditConfig,
        targets: &BTreeSet<ProducerKind>,
    ) -> Vec<Finished> {
        let mut tasks = JoinSet::new();
        let timeouts = &self.settings.timeouts;

        for producer in targets {
            match *producer {
                ProducerKind::Cost => {
                    let source = self.cost.clone();
                    let scope = config.billing_scope();
                    let limit = timeouts.cost;
                    tasks.spawn(async move {
                        Finished::Cost(
                            guarded(ProducerKind::Cost, limit, source.fetch(&scope)).await,
                        )
                    });
                }
                ProducerKind::Audit(kind) => {
                    let Some(auditor) = self.auditors.get(kind).cloned() else {
                        continue;
                    };
                    let project_id = config.project_id().to_string();
                    let regions = config.normalized_regions();
                    let limit = timeouts.audit(kind);
                    tasks.spawn(async move {
                        let fetch = auditor.fetch(&project_id, &regions);
                        Finished::Audit(kind, guarded(ProducerKind::Audit(kind), limit, fetch).await)
                    });
                }
                ProducerKind::Forecast => {
                    let source = self.forecaster.clone();
                    let scope = config.billing_scope();
                    let window = self.settings.forecast_window;
                    let limit = timeouts.forecast;
                    tasks.spawn(async move {
                        let fetch = source.fetch(&scope, window.days, window.historical_days);
                        Finished::Forecast(guarded(ProducerKind::Forecast, limit, fetch).await)
                    });
                }
            }
        }

        let mut pending: BTreeSet<ProducerKind> = targets
            .iter()
            .filter(|p| match p {
                ProducerKind::Audit(kind) => self.auditors.contains(*kind),
                _ => true,
            })
            .copied()
            .collect();
        let mut finished = Vec::with_capacity(pending.len());

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(done) => {
                    pending.remove(&done.producer());
                    finished.push(done);
                }
                Err(e) => warn!("Producer task did not complete: {}", e),
            }
        }
        finished.extend(pending.into_iter().map(Finished::lost));
        finished
    }
}

/// Apply producer results to `snapshot` and recompute the derived fields.
/// Returns a freshly produced forecast, if any, for the forecast cache.
fn merge(snapshot: &mut Snapshot, finished: Vec<Finished>, generation: u64) -> Option<ForecastData> {
    let mut fresh_forecast = None;

    for done in finished {
        match done {
            Finished::Cost(Ok(cost)) => snapshot.cost = cost,
            Finished::Cost(Err(error)) => snapshot.cost = CostFigures::degraded(error),
            Finished::Audit(kind, Ok(report)) => {
                snapshot.audits.insert(kind, AuditOutcome::Completed(report));
            }
            Finished::Audit(kind, Err(error)) => {
                snapshot.audits.insert(kind, AuditOutcome::failed(error));
            }
            Finished::Forecast(Ok(forecast)) => {
                fresh_forecast = Some(forecast.clone());
                snapshot.forecast = Some(forecast);
                snapshot.forecast_error = None;
            }
            Finished::Forecast(Err(error)) => {
                snapshot.forecast = None;
                snapshot.forecast_error = Some(error);
            }
        }
    }

    let mut recommendations: Vec<_> = snapshot
        .audits
        .values()
        .flat_map(|outcome| outcome.recommendations().iter().cloned())
        .collect();
    sort_for_display(&mut recommendations);

    let now = Utc::now();
    snapshot.total_potential_savings = total_savings(&recommendations);
    snapshot.recommendations = recommendations;
    snapshot.billing_month = now.format("%Y-%m").to_string();
    snapshot.created_at = now;
    snapshot.generation_id = generation;
    snapshot.degraded = snapshot.has_error_markers();

    fresh_forecast
}
