//! Configuration types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AuditKind, BillingScope};
use crate::Error;

/// Billing export table prefix used when none is configured.
pub const DEFAULT_TABLE_PREFIX: &str = "gcp_billing_export_v1";

/// BigQuery location used when none is configured.
pub const DEFAULT_LOCATION: &str = "US";

/// Longest forecast horizon accepted, in days.
pub const MAX_FORECAST_DAYS: u32 = 365;

/// Longest billing history a forecast reads, in days.
pub const MAX_HISTORICAL_DAYS: u32 = 1095;

/// Regions audited when none are configured.
pub const DEFAULT_REGIONS: &[&str] = &[
    "asia-east1",
    "europe-west1",
    "us-central1",
    "us-east1",
    "us-west1",
];

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// API access settings.
    #[serde(default)]
    pub gcp: GcpConfig,

    /// The active project audited by single-project commands.
    #[serde(default)]
    pub project: AuditConfig,

    /// Additional projects for multi-project views.
    #[serde(default)]
    pub projects: Vec<AuditConfig>,

    /// Cache TTL classes.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Per-producer timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Forecast window parameters.
    #[serde(default)]
    pub forecast: ForecastConfig,
}

/// The configuration one snapshot is computed under.
///
/// Every field is optional at the type level; `validate` reports which of the
/// required ones are missing, and the fingerprint normalizes the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// GCP project to audit.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Billing export dataset, e.g. `billing-admin.billing_export`.
    #[serde(default)]
    pub billing_dataset: Option<String>,

    /// Billing export table prefix or full table name.
    #[serde(default)]
    pub billing_table_prefix: Option<String>,

    /// Regions to audit. `None` means the default region list.
    #[serde(default)]
    pub regions: Option<Vec<String>>,

    /// BigQuery job location.
    #[serde(default)]
    pub location: Option<String>,

    /// Billing account, when known up front. Only used for grouping.
    #[serde(default)]
    pub billing_account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    /// OAuth2 access token (e.g. from `gcloud auth print-access-token`).
    #[serde(default)]
    pub access_token: String,

    /// Per-client request budget.
    #[serde(default = "default_requests_per_sec")]
    pub requests_per_sec: u32,

    /// HTTP timeout for a single request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,

    /// Forecasts are expensive and move slowly, so they live longer.
    #[serde(default = "default_forecast_ttl")]
    pub forecast_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_cost_timeout")]
    pub cost_secs: u64,

    #[serde(default = "default_forecast_timeout")]
    pub forecast_secs: u64,

    /// Applies to every auditor without an entry in `per_audit`.
    #[serde(default = "default_audit_timeout")]
    pub audit_secs: u64,

    #[serde(default)]
    pub per_audit: BTreeMap<AuditKind, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Include a forecast in every snapshot.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_forecast_days")]
    pub days: u32,

    #[serde(default = "default_historical_days")]
    pub historical_days: u32,
}

fn default_requests_per_sec() -> u32 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_snapshot_ttl() -> u64 {
    300
}
fn default_forecast_ttl() -> u64 {
    3600
}
fn default_cost_timeout() -> u64 {
    60
}
fn default_forecast_timeout() -> u64 {
    120
}
fn default_audit_timeout() -> u64 {
    45
}
fn default_forecast_days() -> u32 {
    90
}
fn default_historical_days() -> u32 {
    180
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            requests_per_sec: default_requests_per_sec(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: default_snapshot_ttl(),
            forecast_ttl_secs: default_forecast_ttl(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cost_secs: default_cost_timeout(),
            forecast_secs: default_forecast_timeout(),
            audit_secs: default_audit_timeout(),
            per_audit: BTreeMap::new(),
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            days: default_forecast_days(),
            historical_days: default_historical_days(),
        }
    }
}

impl ForecastConfig {
    /// Out-of-range window parameters, one message per field.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.days == 0 || self.days > MAX_FORECAST_DAYS {
            issues.push(format!(
                "forecast.days must be between 1 and {MAX_FORECAST_DAYS} (got {})",
                self.days
            ));
        }
        if self.historical_days < 2 || self.historical_days > MAX_HISTORICAL_DAYS {
            issues.push(format!(
                "forecast.historical_days must be between 2 and {MAX_HISTORICAL_DAYS} (got {})",
                self.historical_days
            ));
        }
        issues
    }

    pub fn validate(&self) -> Result<(), Error> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(issues.join("; ")))
        }
    }
}

impl TimeoutConfig {
    pub fn audit_timeout(&self, kind: AuditKind) -> Duration {
        Duration::from_secs(*self.per_audit.get(&kind).unwrap_or(&self.audit_secs))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl AuditConfig {
    pub fn for_project(project_id: impl Into<String>, billing_dataset: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            billing_dataset: Some(billing_dataset.into()),
            ..Self::default()
        }
    }

    /// Check the fields every fan-out needs. All problems are reported at once.
    pub fn validate(&self) -> Result<(), Error> {
        let mut issues: Vec<String> = Vec::new();

        if non_blank(&self.project_id).is_none() {
            issues.push("project_id is required".into());
        }
        if non_blank(&self.billing_dataset).is_none() {
            issues.push("billing_dataset is required".into());
        }
        if let Some(regions) = &self.regions {
            if regions.iter().any(|r| r.trim().contains(char::is_whitespace)) {
                issues.push("regions must not contain whitespace".into());
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigurationInvalid(issues.join("; ")))
        }
    }

    /// Project id with surrounding whitespace removed; empty when unset.
    pub fn project_id(&self) -> &str {
        non_blank(&self.project_id).unwrap_or("")
    }

    pub fn billing_dataset(&self) -> &str {
        non_blank(&self.billing_dataset).unwrap_or("")
    }

    pub fn table_prefix(&self) -> &str {
        non_blank(&self.billing_table_prefix).unwrap_or(DEFAULT_TABLE_PREFIX)
    }

    pub fn location(&self) -> &str {
        non_blank(&self.location).unwrap_or(DEFAULT_LOCATION)
    }

    /// Sorted, deduplicated regions, falling back to `DEFAULT_REGIONS`.
    pub fn normalized_regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self
            .regions
            .iter()
            .flatten()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if regions.is_empty() {
            regions = DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect();
        }
        regions.sort();
        regions.dedup();
        regions
    }

    pub fn billing_scope(&self) -> BillingScope {
        BillingScope {
            project_id: self.project_id().to_string(),
            billing_dataset: self.billing_dataset().to_string(),
            table_prefix: self.table_prefix().to_string(),
            location: self.location().to_string(),
        }
    }
}
