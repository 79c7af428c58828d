//! Cloud Run services (Admin API v2).

use std::collections::HashMap;

use common::{AuditKind, AuditReport, Finding, Priority, Recommendation, Result};
use gcp_client::{GcpClient, Paged};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::thresholds::{CLOUD_RUN_CPU_ALWAYS_ALLOCATED, CLOUD_RUN_PER_MIN_INSTANCE};
use crate::{is_unlabeled, short_name, sweep_regions};

const RUN_BASE: &str = "https://run.googleapis.com/v2";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceList {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Paged for ServiceList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// `projects/{p}/locations/{region}/services/{name}`
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub template: RevisionTemplate,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTemplate {
    #[serde(default)]
    pub scaling: Scaling,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scaling {
    #[serde(default)]
    pub min_instance_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// `false` means CPU is allocated for the whole instance lifetime.
    #[serde(default = "default_cpu_idle")]
    pub cpu_idle: bool,
}

impl Default for Resources {
    fn default() -> Self {
        Self { cpu_idle: true }
    }
}

fn default_cpu_idle() -> bool {
    true
}

impl Service {
    fn cpu_always_allocated(&self) -> bool {
        self.template
            .containers
            .iter()
            .any(|c| !c.resources.cpu_idle)
    }
}

#[derive(Debug, Clone)]
pub struct CloudRunAuditor {
    client: GcpClient,
}

impl CloudRunAuditor {
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self, regions), fields(kind = "cloud_run"))]
    pub async fn audit(&self, project_id: &str, regions: &[String]) -> Result<AuditReport> {
        let sweep = sweep_regions(AuditKind::CloudRun, regions, |region| async move {
            let url = format!("{RUN_BASE}/projects/{project_id}/locations/{region}/services");
            let pages: Vec<ServiceList> = self.client.list_all(&url, &[]).await?;
            Ok(pages.into_iter().flat_map(|p| p.services).collect::<Vec<_>>())
        })
        .await?;

        let mut report = evaluate(&sweep.items);
        report.warnings = sweep.warnings;
        info!(
            "Cloud Run audit for {}: {} service(s), {} recommendation(s)",
            project_id,
            report.total_count,
            report.recommendations.len()
        );
        Ok(report)
    }
}

/// `services` pairs each service with the region it was listed in.
pub fn evaluate(services: &[(String, Service)]) -> AuditReport {
    let mut report = AuditReport {
        total_count: services.len(),
        ..AuditReport::default()
    };

    for (region, service) in services {
        let name = short_name(&service.name);

        if is_unlabeled(&service.labels) {
            report.untagged_count += 1;
        }

        let min_instances = service.template.scaling.min_instance_count;
        if min_instances > 0 {
            report.findings.push(Finding {
                resource_name: name.to_string(),
                location: region.clone(),
                issue: format!("Min instances set to {min_instances}"),
            });
            report.recommendations.push(Recommendation::new(
                AuditKind::CloudRun,
                Priority::High,
                "cloud_run_service",
                name,
                region.as_str(),
                format!(
                    "Min instances set to {min_instances} (always-on cost); set to 0 unless cold starts are critical"
                ),
                CLOUD_RUN_PER_MIN_INSTANCE * f64::from(min_instances),
            ));
        }

        if service.cpu_always_allocated() {
            report.over_provisioned_count += 1;
            report.recommendations.push(Recommendation::new(
                AuditKind::CloudRun,
                Priority::High,
                "cloud_run_service",
                name,
                region.as_str(),
                "CPU is always allocated; switch to request-based billing unless background work needs it",
                CLOUD_RUN_CPU_ALWAYS_ALLOCATED,
            ));
        }
    }

    report
}
