//! Domain types shared across the workspace.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

// ── Producers ────────────────────────────────────────────────────────

/// One auditor per resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Compute,
    CloudRun,
    CloudFunctions,
    CloudSql,
    Storage,
}

impl AuditKind {
    pub const ALL: [AuditKind; 5] = [
        AuditKind::Compute,
        AuditKind::CloudRun,
        AuditKind::CloudFunctions,
        AuditKind::CloudSql,
        AuditKind::Storage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::Compute => "compute",
            AuditKind::CloudRun => "cloud_run",
            AuditKind::CloudFunctions => "cloud_functions",
            AuditKind::CloudSql => "cloud_sql",
            AuditKind::Storage => "storage",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "compute" | "compute_engine" | "gce" => Ok(AuditKind::Compute),
            "cloud_run" | "run" => Ok(AuditKind::CloudRun),
            "cloud_functions" | "functions" | "gcf" => Ok(AuditKind::CloudFunctions),
            "cloud_sql" | "sql" => Ok(AuditKind::CloudSql),
            "storage" | "disks" | "persistent_disks" => Ok(AuditKind::Storage),
            _ => Err(Error::UnknownAuditKind(s.to_string())),
        }
    }
}

/// Anything the orchestrator can refresh on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProducerKind {
    Cost,
    Forecast,
    Audit(AuditKind),
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerKind::Cost => f.write_str("cost"),
            ProducerKind::Forecast => f.write_str("forecast"),
            ProducerKind::Audit(kind) => write!(f, "audit:{kind}"),
        }
    }
}

/// Normalized billing coordinates handed to cost and forecast producers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingScope {
    pub project_id: String,
    pub billing_dataset: String,
    pub table_prefix: String,
    pub location: String,
}

// ── Error markers ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerErrorKind {
    Timeout,
    Failure,
}

/// Recorded in place of a producer's output when it failed or timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerError {
    pub kind: ProducerErrorKind,
    pub message: String,
}

impl ProducerError {
    pub fn timeout(producer: ProducerKind, after: Duration) -> Self {
        let err = Error::ProducerTimeout {
            producer: producer.to_string(),
            after_ms: after.as_millis() as u64,
        };
        Self {
            kind: ProducerErrorKind::Timeout,
            message: err.to_string(),
        }
    }

    pub fn failure(producer: ProducerKind, cause: impl fmt::Display) -> Self {
        let err = Error::ProducerFailure {
            producer: producer.to_string(),
            message: cause.to_string(),
        };
        Self {
            kind: ProducerErrorKind::Failure,
            message: err.to_string(),
        }
    }
}

// ── Recommendations & audit results ──────────────────────────────────

/// Declaration order gives `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(label)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(Error::ConfigurationInvalid(format!(
                "unknown priority '{s}' (expected low, medium, high or critical)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub resource_type: String,
    pub resource_name: String,
    pub location: String,
    pub description: String,
    /// Always >= 0.
    pub potential_monthly_savings: f64,
    pub source: AuditKind,
}

impl Recommendation {
    pub fn new(
        source: AuditKind,
        priority: Priority,
        resource_type: impl Into<String>,
        resource_name: impl Into<String>,
        location: impl Into<String>,
        description: impl Into<String>,
        potential_monthly_savings: f64,
    ) -> Self {
        let savings = if potential_monthly_savings.is_finite() {
            potential_monthly_savings.max(0.0)
        } else {
            0.0
        };
        Self {
            priority,
            resource_type: resource_type.into(),
            resource_name: resource_name.into(),
            location: location.into(),
            description: description.into(),
            potential_monthly_savings: savings,
            source,
        }
    }
}

/// Stable sort: priority descending, then savings descending. Ties keep
/// discovery order.
pub fn sort_for_display(recommendations: &mut [Recommendation]) {
    recommendations.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then_with(|| {
            b.potential_monthly_savings
                .total_cmp(&a.potential_monthly_savings)
        })
    });
}

/// Narrowing of a recommendation list: exact priority and resource type
/// matches, highest savings first, then at most `limit` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecommendationFilter {
    pub priority: Option<Priority>,
    pub resource_type: Option<String>,
    pub limit: Option<usize>,
}

impl RecommendationFilter {
    pub fn apply(&self, recommendations: &[Recommendation]) -> Vec<Recommendation> {
        let mut selected: Vec<Recommendation> = recommendations
            .iter()
            .filter(|r| self.priority.map_or(true, |p| r.priority == p))
            .filter(|r| {
                self.resource_type
                    .as_deref()
                    .map_or(true, |t| r.resource_type == t)
            })
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            b.potential_monthly_savings
                .total_cmp(&a.potential_monthly_savings)
        });
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

pub fn total_savings(recommendations: &[Recommendation]) -> f64 {
    recommendations
        .iter()
        .map(|r| r.potential_monthly_savings)
        .sum()
}

/// A single problem observed on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub resource_name: String,
    pub location: String,
    pub issue: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub total_count: usize,
    pub idle_count: usize,
    pub untagged_count: usize,
    pub over_provisioned_count: usize,
    pub findings: Vec<Finding>,
    pub recommendations: Vec<Recommendation>,
    /// Non-fatal problems, e.g. one region that could not be listed.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl AuditReport {
    pub fn potential_savings(&self) -> f64 {
        total_savings(&self.recommendations)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Completed(AuditReport),
    Failed { error: ProducerError },
}

impl AuditOutcome {
    pub fn failed(error: ProducerError) -> Self {
        AuditOutcome::Failed { error }
    }

    pub fn report(&self) -> Option<&AuditReport> {
        match self {
            AuditOutcome::Completed(report) => Some(report),
            AuditOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ProducerError> {
        match self {
            AuditOutcome::Completed(_) => None,
            AuditOutcome::Failed { error } => Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error().is_some()
    }

    /// Empty for failed outcomes.
    pub fn recommendations(&self) -> &[Recommendation] {
        self.report()
            .map(|r| r.recommendations.as_slice())
            .unwrap_or(&[])
    }

    pub fn findings(&self) -> &[Finding] {
        self.report().map(|r| r.findings.as_slice()).unwrap_or(&[])
    }
}

// ── Costs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostFigures {
    pub current_month_cost: f64,
    pub last_month_cost: f64,
    pub ytd_cost: f64,
    pub service_costs: HashMap<String, f64>,
    /// Set only when the figures are placeholders for a failed fetch.
    /// A real zero-cost project is not degraded.
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub error: Option<ProducerError>,
}

impl CostFigures {
    /// Zero-valued placeholder recorded when the cost producer failed.
    pub fn degraded(error: ProducerError) -> Self {
        Self {
            degraded: true,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Services by descending cost; ties broken by name for a stable order.
    pub fn services_by_cost(&self) -> Vec<(&str, f64)> {
        let mut services: Vec<(&str, f64)> = self
            .service_costs
            .iter()
            .map(|(name, cost)| (name.as_str(), *cost))
            .collect();
        services.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        services
    }

    /// Month-over-month change in percent; `None` without a last-month baseline.
    pub fn month_over_month_pct(&self) -> Option<f64> {
        if self.last_month_cost <= 0.0 {
            return None;
        }
        Some((self.current_month_cost - self.last_month_cost) / self.last_month_cost * 100.0)
    }
}

// ── Forecasts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub predicted_cost: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastData {
    pub points: Vec<ForecastPoint>,
    pub total_predicted_cost: f64,
    pub forecast_days: u32,
    pub historical_days: u32,
    /// Goodness of fit in [0, 1].
    pub model_confidence: f64,
    pub trend: CostTrend,
    pub generated_at: DateTime<Utc>,
}

// ── Snapshots ────────────────────────────────────────────────────────

/// One merged, versioned view of a project's costs and audits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub project_id: String,
    /// `YYYY-MM`.
    pub billing_month: String,
    pub cost: CostFigures,
    /// Failed producers are present with an error marker.
    pub audits: BTreeMap<AuditKind, AuditOutcome>,
    /// Sorted for display: priority, then savings, then discovery order.
    pub recommendations: Vec<Recommendation>,
    pub total_potential_savings: f64,
    #[serde(default)]
    pub forecast: Option<ForecastData>,
    #[serde(default)]
    pub forecast_error: Option<ProducerError>,
    pub created_at: DateTime<Utc>,
    pub generation_id: u64,
    /// True iff any error marker is present.
    pub degraded: bool,
}

impl Snapshot {
    pub fn audit(&self, kind: AuditKind) -> Option<&AuditOutcome> {
        self.audits.get(&kind)
    }

    pub fn failed_kinds(&self) -> Vec<AuditKind> {
        self.audits
            .iter()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Recompute the degraded flag from the markers actually present.
    pub fn has_error_markers(&self) -> bool {
        self.cost.degraded
            || self.forecast_error.is_some()
            || self.audits.values().any(AuditOutcome::is_failed)
    }

    pub fn recommendation_count(&self) -> usize {
        self.recommendations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(priority: Priority, savings: f64, name: &str) -> Recommendation {
        Recommendation::new(
            AuditKind::Compute,
            priority,
            "compute_instance",
            name,
            "us-central1-a",
            "test",
            savings,
        )
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_sort_for_display_is_stable_within_ties() {
        let mut recs = vec![
            rec(Priority::Low, 100.0, "a"),
            rec(Priority::High, 10.0, "b"),
            rec(Priority::High, 30.0, "c"),
            rec(Priority::High, 10.0, "d"),
            rec(Priority::Critical, 1.0, "e"),
        ];
        sort_for_display(&mut recs);
        let order: Vec<&str> = recs.iter().map(|r| r.resource_name.as_str()).collect();
        assert_eq!(order, vec!["e", "c", "b", "d", "a"]);
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!(" High ".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().unwrap_err().is_config());
    }

    #[test]
    fn test_recommendation_filter_narrows_sorts_and_limits() {
        let mut disk = rec(Priority::High, 40.0, "disk-a");
        disk.resource_type = "persistent_disk".into();
        let recs = vec![
            rec(Priority::High, 10.0, "vm-a"),
            disk,
            rec(Priority::Low, 0.0, "vm-b"),
            rec(Priority::High, 25.0, "vm-c"),
        ];

        let all = RecommendationFilter::default().apply(&recs);
        let names: Vec<&str> = all.iter().map(|r| r.resource_name.as_str()).collect();
        assert_eq!(names, vec!["disk-a", "vm-c", "vm-a", "vm-b"]);

        let filter = RecommendationFilter {
            priority: Some(Priority::High),
            resource_type: Some("compute_instance".into()),
            limit: Some(1),
        };
        let picked = filter.apply(&recs);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].resource_name, "vm-c");

        let none = RecommendationFilter {
            resource_type: Some("cloud_sql_instance".into()),
            ..RecommendationFilter::default()
        };
        assert!(none.apply(&recs).is_empty());
    }

    #[test]
    fn test_negative_savings_clamped() {
        let r = rec(Priority::Low, -5.0, "x");
        assert_eq!(r.potential_monthly_savings, 0.0);
        let r = rec(Priority::Low, f64::NAN, "y");
        assert_eq!(r.potential_monthly_savings, 0.0);
    }

    #[test]
    fn test_failed_outcome_has_no_recommendations() {
        let outcome = AuditOutcome::failed(ProducerError::failure(
            ProducerKind::Audit(AuditKind::Storage),
            "permission denied",
        ));
        assert!(outcome.is_failed());
        assert!(outcome.recommendations().is_empty());
        assert!(outcome.findings().is_empty());
        assert!(outcome
            .error()
            .map(|e| e.message.contains("audit:storage"))
            .unwrap_or(false));
    }

    #[test]
    fn test_audit_kind_parsing_aliases() {
        assert_eq!("cloud-run".parse::<AuditKind>().unwrap(), AuditKind::CloudRun);
        assert_eq!("SQL".parse::<AuditKind>().unwrap(), AuditKind::CloudSql);
        assert_eq!("compute".parse::<AuditKind>().unwrap(), AuditKind::Compute);
        assert!("bigtable".parse::<AuditKind>().is_err());
    }

    #[test]
    fn test_services_sorted_by_value() {
        let mut cost = CostFigures::default();
        cost.service_costs.insert("Compute Engine".into(), 40.0);
        cost.service_costs.insert("BigQuery".into(), 75.5);
        cost.service_costs.insert("Cloud Run".into(), 40.0);
        let names: Vec<&str> = cost.services_by_cost().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["BigQuery", "Cloud Run", "Compute Engine"]);
    }

    #[test]
    fn test_degraded_cost_is_explicit() {
        let zero = CostFigures::default();
        assert!(!zero.degraded);
        let degraded = CostFigures::degraded(ProducerError::timeout(
            ProducerKind::Cost,
            Duration::from_secs(3),
        ));
        assert!(degraded.degraded);
        assert_eq!(degraded.current_month_cost, 0.0);
        assert_eq!(degraded.error.as_ref().map(|e| e.kind), Some(ProducerErrorKind::Timeout));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = AuditOutcome::Completed(AuditReport::default());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["total_count"], 0);
    }
}
