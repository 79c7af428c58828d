//! Per-resource-kind GCP auditors.
//!
//! Every auditor lists one kind of inventory, restricted to the configured
//! regions, and turns it into an `AuditReport` with a pure rule function.
//! `GcpAuditor` is the closed set of variants the orchestrator registers.

pub mod cloud_functions;
pub mod cloud_run;
pub mod cloud_sql;
pub mod compute;
pub mod storage;
pub mod thresholds;

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use common::{AuditKind, AuditReport, AuditSource, Error, Result};
use gcp_client::GcpClient;
use tracing::warn;

pub use cloud_functions::CloudFunctionsAuditor;
pub use cloud_run::CloudRunAuditor;
pub use cloud_sql::CloudSqlAuditor;
pub use compute::ComputeAuditor;
pub use storage::StorageAuditor;

#[derive(Debug, Clone)]
pub enum GcpAuditor {
    Compute(ComputeAuditor),
    CloudRun(CloudRunAuditor),
    CloudFunctions(CloudFunctionsAuditor),
    CloudSql(CloudSqlAuditor),
    Storage(StorageAuditor),
}

impl GcpAuditor {
    pub fn new(kind: AuditKind, client: GcpClient) -> Self {
        match kind {
            AuditKind::Compute => GcpAuditor::Compute(ComputeAuditor::new(client)),
            AuditKind::CloudRun => GcpAuditor::CloudRun(CloudRunAuditor::new(client)),
            AuditKind::CloudFunctions => {
                GcpAuditor::CloudFunctions(CloudFunctionsAuditor::new(client))
            }
            AuditKind::CloudSql => GcpAuditor::CloudSql(CloudSqlAuditor::new(client)),
            AuditKind::Storage => GcpAuditor::Storage(StorageAuditor::new(client)),
        }
    }

    /// One auditor per kind, each with its own client from `make_client`.
    pub fn all<F>(make_client: F) -> Result<Vec<Self>>
    where
        F: Fn() -> Result<GcpClient>,
    {
        AuditKind::ALL
            .iter()
            .map(|kind| Ok(Self::new(*kind, make_client()?)))
            .collect()
    }
}

#[async_trait]
impl AuditSource for GcpAuditor {
    fn kind(&self) -> AuditKind {
        match self {
            GcpAuditor::Compute(_) => AuditKind::Compute,
            GcpAuditor::CloudRun(_) => AuditKind::CloudRun,
            GcpAuditor::CloudFunctions(_) => AuditKind::CloudFunctions,
            GcpAuditor::CloudSql(_) => AuditKind::CloudSql,
            GcpAuditor::Storage(_) => AuditKind::Storage,
        }
    }

    async fn fetch(&self, project_id: &str, regions: &[String]) -> Result<AuditReport> {
        match self {
            GcpAuditor::Compute(a) => a.audit(project_id, regions).await,
            GcpAuditor::CloudRun(a) => a.audit(project_id, regions).await,
            GcpAuditor::CloudFunctions(a) => a.audit(project_id, regions).await,
            GcpAuditor::CloudSql(a) => a.audit(project_id, regions).await,
            GcpAuditor::Storage(a) => a.audit(project_id, regions).await,
        }
    }
}

/// Last path segment of a resource URL or name.
pub(crate) fn short_name(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

pub(crate) fn is_unlabeled(labels: &HashMap<String, String>) -> bool {
    labels.is_empty()
}

/// Whether a zone or region belongs to one of `regions`.
/// `us-central1-a` is in `us-central1`; `global` is always in scope.
pub(crate) fn in_regions(location: &str, regions: &[String]) -> bool {
    if location == "global" {
        return true;
    }
    regions.iter().any(|region| {
        location == region
            || location
                .strip_prefix(region.as_str())
                .is_some_and(|rest| rest.starts_with('-') && rest.len() == 2)
    })
}

/// Items listed in each region that answered.
pub(crate) struct RegionSweep<T> {
    pub items: Vec<(String, T)>,
    pub warnings: Vec<String>,
}

/// List `regions` one after another. A failing region becomes a warning;
/// if every region fails, the first error fails the whole audit.
pub(crate) async fn sweep_regions<T, F, Fut>(
    kind: AuditKind,
    regions: &[String],
    list: F,
) -> Result<RegionSweep<T>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let mut items = Vec::new();
    let mut warnings = Vec::new();
    let mut first_error: Option<Error> = None;
    let mut succeeded = 0usize;

    for region in regions {
        match list(region.clone()).await {
            Ok(found) => {
                succeeded += 1;
                items.extend(found.into_iter().map(|item| (region.clone(), item)));
            }
            Err(e) => {
                warn!("{} audit failed for region {}: {}", kind, region, e);
                warnings.push(format!("{region}: {e}"));
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if succeeded == 0 => Err(e),
        _ => Ok(RegionSweep { items, warnings }),
    }
}
