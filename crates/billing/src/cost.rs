//! Cost figures from the BigQuery billing export.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use common::{BillingScope, CostFigures, CostSource, Error, Result};
use gcp_client::GcpClient;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::query::{run_query, DateRange, QueryParameter, Row};
use crate::table::BillingTable;

const CLOUD_BILLING_BASE: &str = "https://cloudbilling.googleapis.com/v1";

/// Services reported in the per-service breakdown.
const TOP_SERVICES: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectBillingInfo {
    #[serde(default)]
    billing_account_name: String,
    #[serde(default)]
    billing_enabled: bool,
}

/// Cost producer querying the billing export dataset.
#[derive(Debug, Clone)]
pub struct BigQueryCostSource {
    client: GcpClient,
}

impl BigQueryCostSource {
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }

    fn project_filter(scope: &BillingScope) -> Vec<QueryParameter> {
        vec![QueryParameter::string("project_id", scope.project_id.clone())]
    }

    async fn total_cost(&self, scope: &BillingScope, range: DateRange) -> Result<f64> {
        let table = BillingTable::new(&scope.billing_dataset, &scope.table_prefix);
        let sql = format!(
            "SELECT SUM(cost) AS total_cost FROM {} WHERE {} AND project.id = @project_id",
            table.reference(),
            table.date_filter_sql()
        );
        let mut params = range.params();
        params.extend(Self::project_filter(scope));

        let rows = run_query(
            &self.client,
            table.job_project(&scope.project_id),
            &scope.location,
            &sql,
            params,
        )
        .await?;

        match rows.first() {
            Some(row) => row.number(0),
            None => Ok(0.0),
        }
    }

    async fn service_costs(
        &self,
        scope: &BillingScope,
        range: DateRange,
    ) -> Result<HashMap<String, f64>> {
        let table = BillingTable::new(&scope.billing_dataset, &scope.table_prefix);
        let sql = format!(
            "SELECT service.description AS service_name, SUM(cost) AS total_cost \
             FROM {} WHERE {} AND project.id = @project_id \
             GROUP BY service_name ORDER BY total_cost DESC LIMIT {}",
            table.reference(),
            table.date_filter_sql(),
            TOP_SERVICES
        );
        let mut params = range.params();
        params.extend(Self::project_filter(scope));

        let rows = run_query(
            &self.client,
            table.job_project(&scope.project_id),
            &scope.location,
            &sql,
            params,
        )
        .await?;

        parse_service_rows(&rows)
    }
}

/// Rows of `(service_name, total_cost)`; unnamed services are grouped.
pub(crate) fn parse_service_rows(rows: &[Row]) -> Result<HashMap<String, f64>> {
    let mut services = HashMap::new();
    for row in rows {
        let name = row.text(0).unwrap_or("Unknown").to_string();
        *services.entry(name).or_insert(0.0) += row.number(1)?;
    }
    Ok(services)
}

/// `billingAccounts/0148A9-A6130F-E0294F` → `0148A9-A6130F-E0294F`.
fn billing_account_id(info: &ProjectBillingInfo) -> Option<String> {
    if !info.billing_enabled {
        return None;
    }
    let id = info
        .billing_account_name
        .strip_prefix("billingAccounts/")
        .unwrap_or(&info.billing_account_name)
        .trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[async_trait]
impl CostSource for BigQueryCostSource {
    #[instrument(skip(self, scope), fields(project = %scope.project_id))]
    async fn fetch(&self, scope: &BillingScope) -> Result<CostFigures> {
        let today = Utc::now().date_naive();

        let (current_month_cost, last_month_cost, ytd_cost, service_costs) = tokio::try_join!(
            self.total_cost(scope, DateRange::current_month(today)),
            self.total_cost(scope, DateRange::last_month(today)),
            self.total_cost(scope, DateRange::year_to_date(today)),
            self.service_costs(scope, DateRange::current_month(today)),
        )?;

        info!(
            "Costs for {}: month={:.2}, last={:.2}, ytd={:.2}, services={}",
            scope.project_id,
            current_month_cost,
            last_month_cost,
            ytd_cost,
            service_costs.len()
        );

        Ok(CostFigures {
            current_month_cost,
            last_month_cost,
            ytd_cost,
            service_costs,
            degraded: false,
            error: None,
        })
    }

    async fn billing_account(&self, project_id: &str) -> Result<Option<String>> {
        let url = format!("{CLOUD_BILLING_BASE}/projects/{project_id}/billingInfo");
        let info: ProjectBillingInfo = match self.client.get_json(&url, &[]).await {
            Ok(info) => info,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let account = billing_account_id(&info);
        debug!("Billing account for {}: {:?}", project_id, account);
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryResponse;

    #[test]
    fn test_service_rows_merge_unnamed_services() {
        let resp: QueryResponse = serde_json::from_str(
            r#"{"jobComplete": true, "rows": [
                {"f": [{"v": "Compute Engine"}, {"v": "40.25"}]},
                {"f": [{"v": null}, {"v": "1.5"}]},
                {"f": [{"v": null}, {"v": "2.0"}]}
            ]}"#,
        )
        .expect("response parses");
        let services = parse_service_rows(&resp.rows).expect("rows parse");
        assert_eq!(services.get("Compute Engine"), Some(&40.25));
        assert_eq!(services.get("Unknown"), Some(&3.5));
    }

    #[test]
    fn test_billing_account_requires_enabled_billing() {
        let info: ProjectBillingInfo = serde_json::from_str(
            r#"{"name": "projects/p1/billingInfo", "projectId": "p1",
                "billingAccountName": "billingAccounts/0148A9-A6130F-E0294F", "billingEnabled": true}"#,
        )
        .expect("billing info parses");
        assert_eq!(billing_account_id(&info).as_deref(), Some("0148A9-A6130F-E0294F"));

        let disabled: ProjectBillingInfo = serde_json::from_str(
            r#"{"billingAccountName": "billingAccounts/0148A9-A6130F-E0294F", "billingEnabled": false}"#,
        )
        .expect("billing info parses");
        assert_eq!(billing_account_id(&disabled), None);

        let empty: ProjectBillingInfo =
            serde_json::from_str(r#"{"billingEnabled": true}"#).expect("billing info parses");
        assert_eq!(billing_account_id(&empty), None);
    }
}
