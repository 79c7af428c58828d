//! Cloud Functions (v2 API).

use std::collections::HashMap;

use common::{AuditKind, AuditReport, Finding, Priority, Recommendation, Result};
use gcp_client::{GcpClient, Paged};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::thresholds::{
    CLOUD_FUNCTION_FAILED, CLOUD_FUNCTION_MEMORY_OPTIMIZATION, CLOUD_FUNCTION_PER_MIN_INSTANCE,
    FUNCTION_MEMORY_CEILING_MB,
};
use crate::{is_unlabeled, short_name, sweep_regions};

const FUNCTIONS_BASE: &str = "https://cloudfunctions.googleapis.com/v2";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionList {
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Paged for FunctionList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub service_config: ServiceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// e.g. `256M`, `1Gi`, `2G`.
    #[serde(default)]
    pub available_memory: Option<String>,
    #[serde(default)]
    pub min_instance_count: u32,
}

/// Memory quantity in MiB. Decimal suffixes are treated as their binary
/// counterparts except `G`, which is 1000 MiB.
pub fn memory_mb(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;
    match unit {
        "Gi" => Some(value * 1024),
        "G" => Some(value * 1000),
        "Mi" | "M" | "" => Some(value),
        "Ki" | "k" => Some(value / 1024),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CloudFunctionsAuditor {
    client: GcpClient,
}

impl CloudFunctionsAuditor {
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self, regions), fields(kind = "cloud_functions"))]
    pub async fn audit(&self, project_id: &str, regions: &[String]) -> Result<AuditReport> {
        let sweep = sweep_regions(AuditKind::CloudFunctions, regions, |region| async move {
            let url = format!("{FUNCTIONS_BASE}/projects/{project_id}/locations/{region}/functions");
            let pages: Vec<FunctionList> = self.client.list_all(&url, &[]).await?;
            Ok(pages.into_iter().flat_map(|p| p.functions).collect::<Vec<_>>())
        })
        .await?;

        let mut report = evaluate(&sweep.items);
        report.warnings = sweep.warnings;
        info!(
            "Cloud Functions audit for {}: {} function(s), {} recommendation(s)",
            project_id,
            report.total_count,
            report.recommendations.len()
        );
        Ok(report)
    }
}

pub fn evaluate(functions: &[(String, Function)]) -> AuditReport {
    let mut report = AuditReport {
        total_count: functions.len(),
        ..AuditReport::default()
    };

    for (region, function) in functions {
        let name = short_name(&function.name);

        if is_unlabeled(&function.labels) {
            report.untagged_count += 1;
        }

        if function.state == "FAILED" {
            report.idle_count += 1;
            report.findings.push(Finding {
                resource_name: name.to_string(),
                location: region.clone(),
                issue: "Function is in FAILED state".to_string(),
            });
            report.recommendations.push(Recommendation::new(
                AuditKind::CloudFunctions,
                Priority::Medium,
                "cloud_function",
                name,
                region.as_str(),
                "Function failed to deploy; fix or delete it",
                CLOUD_FUNCTION_FAILED,
            ));
        }

        let min_instances = function.service_config.min_instance_count;
        if min_instances > 0 {
            report.recommendations.push(Recommendation::new(
                AuditKind::CloudFunctions,
                Priority::Medium,
                "cloud_function",
                name,
                region.as_str(),
                format!("Min instances set to {min_instances}; set to 0 unless cold starts are critical"),
                CLOUD_FUNCTION_PER_MIN_INSTANCE * f64::from(min_instances),
            ));
        }

        let memory = function
            .service_config
            .available_memory
            .as_deref()
            .and_then(|raw| memory_mb(raw).map(|mb| (raw, mb)));
        if let Some((raw, mb)) = memory {
            if mb > FUNCTION_MEMORY_CEILING_MB {
                report.over_provisioned_count += 1;
                report.recommendations.push(Recommendation::new(
                    AuditKind::CloudFunctions,
                    Priority::Low,
                    "cloud_function",
                    name,
                    region.as_str(),
                    format!("{raw} of memory allocated; check whether a smaller size suffices"),
                    CLOUD_FUNCTION_MEMORY_OPTIMIZATION,
                ));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_parsing() {
        assert_eq!(memory_mb("256M"), Some(256));
        assert_eq!(memory_mb("512Mi"), Some(512));
        assert_eq!(memory_mb("1Gi"), Some(1024));
        assert_eq!(memory_mb("2G"), Some(2000));
        assert_eq!(memory_mb("lots"), None);
    }

    #[test]
    fn test_cloud_functions_rules() {
        let page: FunctionList = serde_json::from_str(
            r#"{"functions": [
                {"name": "projects/p/locations/us-east1/functions/resize", "state": "ACTIVE",
                 "labels": {"team": "media"},
                 "serviceConfig": {"availableMemory": "4Gi", "minInstanceCount": 1}},
                {"name": "projects/p/locations/us-east1/functions/broken", "state": "FAILED",
                 "serviceConfig": {"availableMemory": "256M"}},
                {"name": "projects/p/locations/us-east1/functions/ok", "state": "ACTIVE",
                 "labels": {"team": "web"}, "serviceConfig": {"availableMemory": "1Gi"}}
            ]}"#,
        )
        .expect("fixture parses");
        let functions: Vec<(String, Function)> = page
            .functions
            .into_iter()
            .map(|f| ("us-east1".to_string(), f))
            .collect();

        let report = evaluate(&functions);
        assert_eq!(report.total_count, 3);
        assert_eq!(report.untagged_count, 1);
        assert_eq!(report.idle_count, 1);
        assert_eq!(report.over_provisioned_count, 1);
        assert_eq!(report.findings[0].resource_name, "broken");

        let names: Vec<(&str, Priority)> = report
            .recommendations
            .iter()
            .map(|r| (r.resource_name.as_str(), r.priority))
            .collect();
        assert_eq!(
            names,
            vec![
                ("resize", Priority::Medium),
                ("resize", Priority::Low),
                ("broken", Priority::Medium),
            ]
        );
        assert_eq!(report.potential_savings(), 21.0);
    }
}
