//! Cloud SQL instances (Admin API v1).

use std::collections::HashMap;

use common::{AuditKind, AuditReport, Finding, Priority, Recommendation, Result};
use gcp_client::{GcpClient, Paged};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::thresholds::CLOUD_SQL_STOPPED;
use crate::{in_regions, is_unlabeled};

const SQLADMIN_BASE: &str = "https://sqladmin.googleapis.com/v1";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceList {
    #[serde(default)]
    pub items: Vec<DatabaseInstance>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Paged for InstanceList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInstance {
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub database_version: String,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub tier: String,
    /// `ALWAYS`, `NEVER` or `ON_DEMAND`.
    #[serde(default)]
    pub activation_policy: String,
    #[serde(default)]
    pub user_labels: HashMap<String, String>,
}

impl DatabaseInstance {
    fn is_stopped(&self) -> bool {
        self.state != "RUNNABLE" || self.settings.activation_policy == "NEVER"
    }
}

#[derive(Debug, Clone)]
pub struct CloudSqlAuditor {
    client: GcpClient,
}

impl CloudSqlAuditor {
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self, regions), fields(kind = "cloud_sql"))]
    pub async fn audit(&self, project_id: &str, regions: &[String]) -> Result<AuditReport> {
        let url = format!("{SQLADMIN_BASE}/projects/{project_id}/instances");
        let pages: Vec<InstanceList> = self.client.list_all(&url, &[]).await?;

        let instances: Vec<DatabaseInstance> = pages
            .into_iter()
            .flat_map(|p| p.items)
            .filter(|instance| in_regions(&instance.region, regions))
            .collect();

        let report = evaluate(&instances);
        info!(
            "Cloud SQL audit for {}: {} instance(s), {} stopped",
            project_id, report.total_count, report.idle_count
        );
        Ok(report)
    }
}

pub fn evaluate(instances: &[DatabaseInstance]) -> AuditReport {
    let mut report = AuditReport {
        total_count: instances.len(),
        ..AuditReport::default()
    };

    for instance in instances {
        if is_unlabeled(&instance.settings.user_labels) {
            report.untagged_count += 1;
        }

        if instance.is_stopped() {
            report.idle_count += 1;
            let issue = if instance.settings.activation_policy == "NEVER" {
                "Activation policy is NEVER".to_string()
            } else {
                format!("Instance is in {} state", instance.state)
            };
            report.findings.push(Finding {
                resource_name: instance.name.clone(),
                location: instance.region.clone(),
                issue: issue.clone(),
            });
            report.recommendations.push(Recommendation::new(
                AuditKind::CloudSql,
                Priority::Medium,
                "cloud_sql_instance",
                &instance.name,
                &instance.region,
                format!(
                    "{issue}; storage and IPs are still billed, delete {} instance if no longer needed",
                    instance.settings.tier
                ),
                CLOUD_SQL_STOPPED,
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_sql_rules() {
        let page: InstanceList = serde_json::from_str(
            r#"{"items": [
                {"name": "orders", "region": "us-central1", "state": "RUNNABLE",
                 "databaseVersion": "POSTGRES_15",
                 "settings": {"tier": "db-custom-2-7680", "activationPolicy": "ALWAYS",
                              "userLabels": {"team": "orders"}}},
                {"name": "legacy", "region": "us-central1", "state": "RUNNABLE",
                 "settings": {"tier": "db-f1-micro", "activationPolicy": "NEVER"}},
                {"name": "old", "region": "europe-west1", "state": "SUSPENDED",
                 "settings": {"tier": "db-g1-small", "activationPolicy": "ALWAYS"}}
            ]}"#,
        )
        .expect("fixture parses");

        let report = evaluate(&page.items);
        assert_eq!(report.total_count, 3);
        assert_eq!(report.untagged_count, 2);
        assert_eq!(report.idle_count, 2);
        assert_eq!(report.findings[0].issue, "Activation policy is NEVER");
        assert_eq!(report.findings[1].issue, "Instance is in SUSPENDED state");
        assert!(report
            .recommendations
            .iter()
            .all(|r| r.priority == Priority::Medium && r.source == AuditKind::CloudSql));
        assert_eq!(report.potential_savings(), 100.0);
    }
}
