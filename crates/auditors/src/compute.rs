//! Compute Engine instances.

use std::collections::HashMap;

use common::{AuditKind, AuditReport, Finding, Priority, Recommendation, Result};
use gcp_client::{GcpClient, Paged};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::thresholds::{COMPUTE_PREEMPTIBLE_SAVINGS, COMPUTE_STOPPED_DISK_COST};
use crate::{in_regions, is_unlabeled, short_name};

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";

const IDLE_STATES: [&str; 3] = ["STOPPED", "SUSPENDED", "TERMINATED"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAggregatedList {
    /// Keyed by scope, e.g. `zones/us-central1-a`.
    #[serde(default)]
    pub items: HashMap<String, InstancesScopedList>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Paged for InstanceAggregatedList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct InstancesScopedList {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub machine_type: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub scheduling: Scheduling,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    #[serde(default)]
    pub preemptible: bool,
    /// `STANDARD` or `SPOT`.
    #[serde(default)]
    pub provisioning_model: Option<String>,
}

impl Instance {
    fn is_preemptible(&self) -> bool {
        self.scheduling.preemptible || self.scheduling.provisioning_model.as_deref() == Some("SPOT")
    }
}

#[derive(Debug, Clone)]
pub struct ComputeAuditor {
    client: GcpClient,
}

impl ComputeAuditor {
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self, regions), fields(kind = "compute"))]
    pub async fn audit(&self, project_id: &str, regions: &[String]) -> Result<AuditReport> {
        let url = format!("{COMPUTE_BASE}/projects/{project_id}/aggregated/instances");
        let pages: Vec<InstanceAggregatedList> = self
            .client
            .list_all(&url, &[("returnPartialSuccess", "true".to_string())])
            .await?;

        let instances: Vec<Instance> = pages
            .into_iter()
            .flat_map(|page| page.items.into_values())
            .flat_map(|scoped| scoped.instances)
            .filter(|instance| in_regions(short_name(&instance.zone), regions))
            .collect();

        let report = evaluate(&instances);
        info!(
            "Compute audit for {}: {} instance(s), {} idle, {} recommendation(s)",
            project_id,
            report.total_count,
            report.idle_count,
            report.recommendations.len()
        );
        Ok(report)
    }
}

pub fn evaluate(instances: &[Instance]) -> AuditReport {
    let mut report = AuditReport {
        total_count: instances.len(),
        ..AuditReport::default()
    };

    for instance in instances {
        let zone = short_name(&instance.zone);

        if is_unlabeled(&instance.labels) {
            report.untagged_count += 1;
        }

        if IDLE_STATES.contains(&instance.status.as_str()) {
            report.idle_count += 1;
            report.findings.push(Finding {
                resource_name: instance.name.clone(),
                location: zone.to_string(),
                issue: format!("Instance is {}", instance.status),
            });
            report.recommendations.push(Recommendation::new(
                AuditKind::Compute,
                Priority::Medium,
                "compute_instance",
                &instance.name,
                zone,
                format!(
                    "Instance is {} but its disks still incur storage costs; snapshot and delete if no longer needed",
                    instance.status
                ),
                COMPUTE_STOPPED_DISK_COST,
            ));
        } else if instance.status == "RUNNING" && !instance.is_preemptible() {
            report.recommendations.push(Recommendation::new(
                AuditKind::Compute,
                Priority::Low,
                "compute_instance",
                &instance.name,
                zone,
                format!(
                    "Non-preemptible {} instance; consider Spot VMs if the workload tolerates interruption",
                    short_name(&instance.machine_type)
                ),
                COMPUTE_PREEMPTIBLE_SAVINGS,
            ));
        }
    }

    report
}
