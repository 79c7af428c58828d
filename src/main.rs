mod config;
mod output;

use std::sync::Arc;
use std::time::Duration;

use auditors::GcpAuditor;
use billing::{BigQueryCostSource, BudgetClient, TrendForecastSource};
use clap::{Args, Parser, Subcommand};
use common::config::AppConfig;
use common::{AuditConfig, AuditKind, Error, Priority, RecommendationFilter, Result, Snapshot};
use gcp_client::GcpClient;
use serde::Serialize;
use snapshot::{
    spawn_invalidation_listener, AuditorRegistry, ConfigProvider, Orchestrator,
    OrchestratorSettings, SnapshotCache,
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Exit status for configuration errors (EX_CONFIG).
const EXIT_CONFIG: i32 = 78;

type GcpOrchestrator = Orchestrator<BigQueryCostSource, GcpAuditor, TrendForecastSource>;

#[derive(Parser)]
#[command(name = "spendscope", about = "GCP cost and resource audit snapshots")]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// Print JSON instead of summary lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

/// Overrides for the active project, applied on top of file and env config.
#[derive(Args, Debug, Clone, Default)]
struct TargetArgs {
    #[arg(long, global = true)]
    project: Option<String>,

    #[arg(long, global = true)]
    billing_dataset: Option<String>,

    #[arg(long, global = true)]
    table_prefix: Option<String>,

    /// Comma-separated region list.
    #[arg(long, global = true, value_delimiter = ',')]
    regions: Option<Vec<String>>,

    /// BigQuery job location.
    #[arg(long, global = true)]
    location: Option<String>,
}

impl TargetArgs {
    fn apply(&self, project: &mut AuditConfig) {
        if let Some(id) = &self.project {
            project.project_id = Some(id.clone());
        }
        if let Some(dataset) = &self.billing_dataset {
            project.billing_dataset = Some(dataset.clone());
        }
        if let Some(prefix) = &self.table_prefix {
            project.billing_table_prefix = Some(prefix.clone());
        }
        if let Some(regions) = &self.regions {
            project.regions = Some(regions.clone());
        }
        if let Some(location) = &self.location {
            project.location = Some(location.clone());
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Full cost and audit snapshot for the active project.
    Snapshot {
        #[arg(long)]
        refresh: bool,
    },
    /// One audit kind (compute, cloud_run, cloud_functions, cloud_sql, storage).
    Audit {
        kind: String,
        #[arg(long)]
        refresh: bool,
    },
    /// Every configured project, optionally grouped by billing account.
    Projects {
        #[arg(long)]
        group: bool,
    },
    /// Cost forecast for the active project.
    Forecast {
        #[arg(long)]
        refresh: bool,
        /// Days to forecast; defaults to `forecast.days`.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Recommendations from the snapshot, highest savings first.
    Recommendations {
        /// low, medium, high or critical.
        #[arg(long)]
        priority: Option<String>,
        /// e.g. compute_instance, persistent_disk.
        #[arg(long)]
        resource_type: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        refresh: bool,
    },
    /// Budget thresholds reached by this month's spend.
    Budgets {
        /// List every threshold, reached or not.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        refresh: bool,
    },
    /// Refresh on an interval until Ctrl-C, reloading config every tick.
    Watch {
        #[arg(long, default_value_t = 900)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "spendscope=info,snapshot=info,billing=info,auditors=info,gcp_client=info".into()
        }))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(err: &Error) -> i32 {
    if err.is_config() {
        EXIT_CONFIG
    } else {
        1
    }
}

fn gcp_client(app: &AppConfig) -> Result<GcpClient> {
    GcpClient::new(
        app.gcp.access_token.clone(),
        app.gcp.requests_per_sec,
        Duration::from_secs(app.gcp.request_timeout_secs),
    )
}

fn build_orchestrator(app: &AppConfig) -> Result<GcpOrchestrator> {
    let make_client = || gcp_client(app);

    let cost = BigQueryCostSource::new(make_client()?);
    let forecaster = TrendForecastSource::new(make_client()?);
    let registry = AuditorRegistry::new(GcpAuditor::all(make_client)?);

    Ok(Orchestrator::new(
        cost,
        registry,
        forecaster,
        Arc::new(SnapshotCache::new()),
        OrchestratorSettings::from_config(app),
    ))
}

fn emit<T: Serialize>(json: bool, value: &T, lines: impl FnOnce() -> Vec<String>) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        for line in lines() {
            println!("{line}");
        }
    }
    Ok(())
}

/// Command-line values on top of the loaded config, re-checked where they
/// can leave the validated range.
fn apply_overrides(cli: &Cli, app: &mut AppConfig) -> Result<()> {
    cli.target.apply(&mut app.project);
    if let Command::Forecast {
        days: Some(days), ..
    } = &cli.command
    {
        app.forecast.days = *days;
        app.forecast.validate()?;
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut app = config::load_config()?;
    apply_overrides(&cli, &mut app)?;

    info!(
        "spendscope starting: project={} regions={:?}",
        app.project.project_id(),
        app.project.normalized_regions()
    );
    let orchestrator = build_orchestrator(&app)?;
    let json = cli.json;

    match cli.command {
        Command::Snapshot { refresh } => {
            let snapshot = orchestrator.get_snapshot(&app.project, refresh).await?;
            emit(json, &*snapshot, || output::snapshot_lines(&snapshot))
        }
        Command::Audit { kind, refresh } => {
            let kind: AuditKind = kind.parse()?;
            let outcome = orchestrator
                .get_snapshot_for_audit(&app.project, kind, refresh)
                .await?;
            emit(json, &outcome, || output::audit_lines(kind, &outcome))
        }
        Command::Projects { group } => {
            let projects = config::project_configs(&app);
            let view = orchestrator.get_multi_project_view(&projects, group).await?;
            emit(json, &view, || output::view_lines(&view))
        }
        Command::Forecast { refresh, .. } => {
            let forecast = orchestrator.get_forecast(&app.project, refresh).await?;
            emit(json, &*forecast, || vec![output::forecast_line(&forecast)])
        }
        Command::Recommendations {
            priority,
            resource_type,
            limit,
            refresh,
        } => {
            let filter = RecommendationFilter {
                priority: priority.as_deref().map(str::parse::<Priority>).transpose()?,
                resource_type,
                limit,
            };
            let snapshot = orchestrator.get_snapshot(&app.project, refresh).await?;
            let recommendations = filter.apply(&snapshot.recommendations);
            emit(json, &recommendations, || {
                output::recommendation_lines(&recommendations)
            })
        }
        Command::Budgets { all, refresh } => {
            let snapshot = orchestrator.get_snapshot(&app.project, refresh).await?;
            ensure_spend_known(&snapshot)?;
            let project_id = app.project.project_id();
            let account = orchestrator
                .resolve_billing_account(&app.project)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("no billing account linked to {project_id}"))
                })?;

            let budgets = BudgetClient::new(gcp_client(&app)?);
            let alerts = if all {
                budgets
                    .get_budget_alerts(&account, project_id, &snapshot.cost)
                    .await?
            } else {
                budgets
                    .check_budget_breaches(&account, project_id, &snapshot.cost)
                    .await?
            };
            emit(json, &alerts, || output::budget_lines(&account, &alerts))
        }
        Command::Watch { interval_secs } => {
            watch(
                Arc::new(orchestrator),
                app.project,
                cli.target,
                Duration::from_secs(interval_secs.max(1)),
            )
            .await
        }
    }
}

/// Budget checks against a degraded zero would always pass.
fn ensure_spend_known(snapshot: &Snapshot) -> Result<()> {
    match &snapshot.cost.error {
        Some(error) => Err(Error::Other(format!(
            "current month spend unavailable: {}",
            error.message
        ))),
        None => Ok(()),
    }
}

async fn watch(
    orchestrator: Arc<GcpOrchestrator>,
    initial: AuditConfig,
    target: TargetArgs,
    every: Duration,
) -> Result<()> {
    initial.validate()?;
    let provider = ConfigProvider::new(initial);
    let listener = spawn_invalidation_listener(orchestrator.cache().clone(), provider.subscribe());

    info!("Watching every {:?}. Press Ctrl-C to stop.", every);

    // Refresh loop: reload config, then serve from cache or refetch.
    let refresh_orchestrator = orchestrator.clone();
    let refresh_handle = tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            match config::load_config() {
                Ok(app) => {
                    let mut project = app.project;
                    target.apply(&mut project);
                    if let Err(e) = project.validate() {
                        warn!("Ignoring reloaded config: {}", e);
                    } else if provider.update(project) {
                        info!("Configuration changed; cached snapshots invalidated");
                    }
                }
                Err(e) => warn!("Config reload failed, keeping previous: {}", e),
            }

            let current = provider.current();
            match refresh_orchestrator.get_snapshot(&current, false).await {
                Ok(snapshot) => info!(
                    "{} gen={} cost={:.2} savings={:.2} degraded={}",
                    snapshot.project_id,
                    snapshot.generation_id,
                    snapshot.cost.current_month_cost,
                    snapshot.total_potential_savings,
                    snapshot.degraded
                ),
                Err(e) => error!("Snapshot refresh failed: {}", e),
            }
        }
    });

    let cache = orchestrator.cache().clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            info!("HEARTBEAT: live_snapshots={}", cache.live_count());
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = refresh_handle => {
            error!("Refresh loop exited: {:?}", result);
        }
        result = heartbeat_handle => {
            error!("Heartbeat exited: {:?}", result);
        }
    }

    listener.abort();
    info!("spendscope stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_overrides_after_subcommand() {
        let cli = Cli::try_parse_from([
            "spendscope",
            "audit",
            "cloud-run",
            "--refresh",
            "--project",
            "p1",
            "--regions",
            "us-east1,us-west1",
        ])
        .expect("cli parses");

        let mut project = AuditConfig::default();
        cli.target.apply(&mut project);
        assert_eq!(project.project_id.as_deref(), Some("p1"));
        assert_eq!(
            project.regions,
            Some(vec!["us-east1".to_string(), "us-west1".to_string()])
        );
        match cli.command {
            Command::Audit { kind, refresh } => {
                assert_eq!(kind.parse::<AuditKind>().expect("kind"), AuditKind::CloudRun);
                assert!(refresh);
            }
            _ => panic!("expected audit subcommand"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Error::ConfigurationInvalid("x".into())), EXIT_CONFIG);
        assert_eq!(exit_code(&Error::Config("x".into())), EXIT_CONFIG);
        assert_eq!(exit_code(&Error::UnknownAuditKind("gpu".into())), 1);
    }

    #[test]
    fn test_forecast_days_override_is_bounded() {
        let cli = Cli::try_parse_from(["spendscope", "forecast", "--days", "4000000000"])
            .expect("cli parses");
        let err = apply_overrides(&cli, &mut AppConfig::default()).unwrap_err();
        assert_eq!(exit_code(&err), EXIT_CONFIG);

        let cli = Cli::try_parse_from(["spendscope", "forecast", "--days", "30"])
            .expect("cli parses");
        let mut app = AppConfig::default();
        apply_overrides(&cli, &mut app).expect("in range");
        assert_eq!(app.forecast.days, 30);
    }

    #[test]
    fn test_recommendation_filters_parse() {
        let cli = Cli::try_parse_from([
            "spendscope",
            "recommendations",
            "--priority",
            "high",
            "--resource-type",
            "persistent_disk",
            "--limit",
            "5",
        ])
        .expect("cli parses");
        match cli.command {
            Command::Recommendations {
                priority,
                resource_type,
                limit,
                refresh,
            } => {
                assert_eq!(priority.as_deref(), Some("high"));
                assert_eq!(resource_type.as_deref(), Some("persistent_disk"));
                assert_eq!(limit, Some(5));
                assert!(!refresh);
            }
            _ => panic!("expected recommendations subcommand"),
        }
    }

    #[test]
    fn test_budgets_need_known_spend() {
        use common::{CostFigures, ProducerError, ProducerKind};

        let mut snapshot = Snapshot {
            project_id: "p1".into(),
            billing_month: "2026-10".into(),
            cost: CostFigures::degraded(ProducerError::failure(ProducerKind::Cost, "denied")),
            audits: Default::default(),
            recommendations: Vec::new(),
            total_potential_savings: 0.0,
            forecast: None,
            forecast_error: None,
            created_at: chrono::Utc::now(),
            generation_id: 1,
            degraded: true,
        };
        let err = ensure_spend_known(&snapshot).unwrap_err();
        assert!(err.to_string().contains("denied"));

        snapshot.cost = CostFigures::default();
        assert!(ensure_spend_known(&snapshot).is_ok());
    }

    #[test]
    fn test_overrides_leave_unset_fields_alone() {
        let mut project = AuditConfig::for_project("p1", "billing.export");
        TargetArgs {
            location: Some("EU".into()),
            ..TargetArgs::default()
        }
        .apply(&mut project);
        assert_eq!(project.project_id(), "p1");
        assert_eq!(project.location(), "EU");
    }
}
