//! Budgets from the Cloud Billing Budgets API, checked against the month's
//! spend from a snapshot.
//!
//! Threshold rules are fractions of the budget amount (`0.9` is 90%), as the
//! API reports them. A budget scoped to projects lists them as
//! `projects/{number}`, so matching accepts either the id or the number.

use common::{CostFigures, Error, Result};
use gcp_client::{GcpClient, Paged};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

const BUDGETS_BASE: &str = "https://billingbudgets.googleapis.com/v1";
const RESOURCE_MANAGER_BASE: &str = "https://cloudresourcemanager.googleapis.com/v3";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetList {
    #[serde(default)]
    pub budgets: Vec<RawBudget>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Paged for BudgetList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBudget {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub budget_filter: Option<RawFilter>,
    #[serde(default)]
    pub amount: Option<RawAmount>,
    #[serde(default)]
    pub threshold_rules: Vec<RawThresholdRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFilter {
    #[serde(default)]
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAmount {
    #[serde(default)]
    pub specified_amount: Option<Money>,
    #[serde(default)]
    pub last_period_amount: Option<serde_json::Value>,
}

/// `google.type.Money`; `units` is an int64 and arrives as a JSON string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Money {
    #[serde(default)]
    pub currency_code: String,
    #[serde(default)]
    pub units: Option<Int64>,
    #[serde(default)]
    pub nanos: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Int64 {
    Number(i64),
    Text(String),
}

impl Int64 {
    fn value(&self) -> Option<i64> {
        match self {
            Int64::Number(n) => Some(*n),
            Int64::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl Money {
    fn amount(&self) -> f64 {
        let units = self.units.as_ref().and_then(Int64::value).unwrap_or(0);
        units as f64 + self.nanos as f64 / 1e9
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawThresholdRule {
    #[serde(default)]
    pub threshold_percent: f64,
    #[serde(default)]
    pub spend_basis: Option<String>,
}

/// How large a budget is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum BudgetAmount {
    Specified(f64),
    /// Whatever was spent in the previous period.
    LastPeriod,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Threshold {
    /// Fraction of the budget amount, e.g. `0.5`.
    pub fraction: f64,
    pub spend_basis: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Budget {
    pub budget_id: String,
    pub display_name: String,
    pub billing_account_id: String,
    pub amount: BudgetAmount,
    pub currency: String,
    pub thresholds: Vec<Threshold>,
    /// Project ids or numbers; empty means every project on the account.
    pub projects: Vec<String>,
}

fn last_segment(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

impl Budget {
    pub fn from_raw(raw: RawBudget, billing_account_id: &str) -> Self {
        let (amount, currency) = match &raw.amount {
            Some(RawAmount {
                specified_amount: Some(money),
                ..
            }) => (
                BudgetAmount::Specified(money.amount()),
                money.currency_code.clone(),
            ),
            Some(RawAmount {
                last_period_amount: Some(_),
                ..
            }) => (BudgetAmount::LastPeriod, String::new()),
            _ => (BudgetAmount::Specified(0.0), String::new()),
        };
        let currency = if currency.is_empty() {
            "USD".to_string()
        } else {
            currency
        };

        Self {
            budget_id: last_segment(&raw.name).to_string(),
            display_name: raw.display_name,
            billing_account_id: billing_account_id.to_string(),
            amount,
            currency,
            thresholds: raw
                .threshold_rules
                .into_iter()
                .map(|rule| Threshold {
                    fraction: rule.threshold_percent,
                    spend_basis: rule
                        .spend_basis
                        .unwrap_or_else(|| "CURRENT_SPEND".to_string()),
                })
                .collect(),
            projects: raw
                .budget_filter
                .map(|f| {
                    f.projects
                        .iter()
                        .map(|p| last_segment(p).to_string())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn applies_to(&self, project_id: &str, project_number: Option<&str>) -> bool {
        self.projects.is_empty()
            || self
                .projects
                .iter()
                .any(|p| p == project_id || Some(p.as_str()) == project_number)
    }

    /// Budget size for a month with the given cost figures.
    pub fn resolved_amount(&self, cost: &CostFigures) -> f64 {
        match self.amount {
            BudgetAmount::Specified(amount) => amount,
            BudgetAmount::LastPeriod => cost.last_month_cost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    pub budget_id: String,
    pub budget_name: String,
    pub project_id: String,
    pub billing_account_id: String,
    pub threshold: f64,
    pub spend_basis: String,
    pub budget_amount: f64,
    pub currency: String,
    pub current_spend: f64,
    /// `current_spend / budget_amount`; zero for a zero budget.
    pub spend_fraction: f64,
    pub breached: bool,
}

/// One alert per threshold rule of every budget covering the project, with
/// spend from `cost`.
pub fn budget_alerts(
    budgets: &[Budget],
    project_id: &str,
    project_number: Option<&str>,
    cost: &CostFigures,
) -> Vec<BudgetAlert> {
    let spend = cost.current_month_cost;
    budgets
        .iter()
        .filter(|b| b.applies_to(project_id, project_number))
        .flat_map(|budget| {
            let amount = budget.resolved_amount(cost);
            let spend_fraction = if amount > 0.0 { spend / amount } else { 0.0 };
            budget.thresholds.iter().map(move |rule| BudgetAlert {
                budget_id: budget.budget_id.clone(),
                budget_name: budget.display_name.clone(),
                project_id: project_id.to_string(),
                billing_account_id: budget.billing_account_id.clone(),
                threshold: rule.fraction,
                spend_basis: rule.spend_basis.clone(),
                budget_amount: amount,
                currency: budget.currency.clone(),
                current_spend: spend,
                spend_fraction,
                breached: amount > 0.0 && spend_fraction >= rule.fraction,
            })
        })
        .collect()
}

/// Only the thresholds the month's spend has reached.
pub fn budget_breaches(
    budgets: &[Budget],
    project_id: &str,
    project_number: Option<&str>,
    cost: &CostFigures,
) -> Vec<BudgetAlert> {
    budget_alerts(budgets, project_id, project_number, cost)
        .into_iter()
        .filter(|alert| alert.breached)
        .collect()
}

#[derive(Debug, Deserialize)]
struct ProjectResource {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone)]
pub struct BudgetClient {
    client: GcpClient,
}

impl BudgetClient {
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self))]
    pub async fn list_budgets(&self, billing_account_id: &str) -> Result<Vec<Budget>> {
        let url = format!("{BUDGETS_BASE}/billingAccounts/{billing_account_id}/budgets");
        let pages: Vec<BudgetList> = self.client.list_all(&url, &[]).await?;
        let budgets: Vec<Budget> = pages
            .into_iter()
            .flat_map(|page| page.budgets)
            .map(|raw| Budget::from_raw(raw, billing_account_id))
            .collect();
        info!("{} budget(s) on {}", budgets.len(), billing_account_id);
        Ok(budgets)
    }

    /// `projects/123456789` → `123456789`. Missing or unreadable projects
    /// fall back to id matching only.
    pub async fn project_number(&self, project_id: &str) -> Result<Option<String>> {
        let url = format!("{RESOURCE_MANAGER_BASE}/projects/{project_id}");
        match self.client.get_json::<ProjectResource>(&url, &[]).await {
            Ok(project) => {
                let number = last_segment(&project.name).to_string();
                debug!("Project number for {}: {}", project_id, number);
                Ok((!number.is_empty()).then_some(number))
            }
            Err(Error::NotFound(_)) | Err(Error::PermissionDenied(_)) => {
                warn!("Project number unavailable for {}", project_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn project_budgets(
        &self,
        billing_account_id: &str,
        project_id: &str,
    ) -> Result<(Vec<Budget>, Option<String>)> {
        tokio::try_join!(
            self.list_budgets(billing_account_id),
            self.project_number(project_id),
        )
    }

    /// Every threshold of the project's budgets, breached or not.
    pub async fn get_budget_alerts(
        &self,
        billing_account_id: &str,
        project_id: &str,
        cost: &CostFigures,
    ) -> Result<Vec<BudgetAlert>> {
        let (budgets, number) = self.project_budgets(billing_account_id, project_id).await?;
        Ok(budget_alerts(&budgets, project_id, number.as_deref(), cost))
    }

    pub async fn check_budget_breaches(
        &self,
        billing_account_id: &str,
        project_id: &str,
        cost: &CostFigures,
    ) -> Result<Vec<BudgetAlert>> {
        let (budgets, number) = self.project_budgets(billing_account_id, project_id).await?;
        let breaches = budget_breaches(&budgets, project_id, number.as_deref(), cost);
        if !breaches.is_empty() {
            warn!(
                "{} budget threshold(s) reached for {}",
                breaches.len(),
                project_id
            );
        }
        Ok(breaches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgets() -> Vec<Budget> {
        let page: BudgetList = serde_json::from_str(
            r#"{
              "budgets": [
                {
                  "name": "billingAccounts/0148A9-A6130F-E0294F/budgets/b-team",
                  "displayName": "team",
                  "budgetFilter": {"projects": ["projects/123456789"]},
                  "amount": {"specifiedAmount": {"currencyCode": "EUR", "units": "1000", "nanos": 500000000}},
                  "thresholdRules": [
                    {"thresholdPercent": 0.5},
                    {"thresholdPercent": 0.9, "spendBasis": "FORECASTED_SPEND"}
                  ]
                },
                {
                  "name": "billingAccounts/0148A9-A6130F-E0294F/budgets/b-all",
                  "displayName": "account",
                  "amount": {"lastPeriodAmount": {}},
                  "thresholdRules": [{"thresholdPercent": 1.0}]
                },
                {
                  "name": "billingAccounts/0148A9-A6130F-E0294F/budgets/b-other",
                  "displayName": "other",
                  "budgetFilter": {"projects": ["projects/555"]},
                  "amount": {"specifiedAmount": {"units": 10}},
                  "thresholdRules": [{"thresholdPercent": 0.1}]
                }
              ],
              "nextPageToken": ""
            }"#,
        )
        .expect("budget page parses");
        page.budgets
            .into_iter()
            .map(|raw| Budget::from_raw(raw, "0148A9-A6130F-E0294F"))
            .collect()
    }

    fn cost(current: f64, last: f64) -> CostFigures {
        CostFigures {
            current_month_cost: current,
            last_month_cost: last,
            ..CostFigures::default()
        }
    }

    #[test]
    fn test_budget_fields_are_normalized() {
        let budgets = budgets();
        assert_eq!(budgets[0].budget_id, "b-team");
        assert_eq!(budgets[0].amount, BudgetAmount::Specified(1000.5));
        assert_eq!(budgets[0].currency, "EUR");
        assert_eq!(budgets[0].projects, vec!["123456789".to_string()]);
        assert_eq!(budgets[0].thresholds[0].spend_basis, "CURRENT_SPEND");
        assert_eq!(budgets[1].amount, BudgetAmount::LastPeriod);
        assert_eq!(budgets[1].currency, "USD");
        assert_eq!(budgets[2].amount, BudgetAmount::Specified(10.0));
    }

    #[test]
    fn test_scoped_budgets_match_by_number_or_id() {
        let budgets = budgets();
        assert!(budgets[0].applies_to("web-prod", Some("123456789")));
        assert!(budgets[0].applies_to("123456789", None));
        assert!(!budgets[0].applies_to("web-prod", None));
        assert!(budgets[1].applies_to("anything", None));
    }

    #[test]
    fn test_alerts_cover_every_threshold_of_matching_budgets() {
        let alerts = budget_alerts(
            &budgets(),
            "web-prod",
            Some("123456789"),
            &cost(600.0, 800.0),
        );
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|a| a.budget_id != "b-other"));

        let team_half = &alerts[0];
        assert!(team_half.breached);
        assert!((team_half.spend_fraction - 600.0 / 1000.5).abs() < 1e-9);
        assert!(!alerts[1].breached);
        assert_eq!(alerts[1].spend_basis, "FORECASTED_SPEND");

        let account = &alerts[2];
        assert_eq!(account.budget_amount, 800.0);
        assert!(!account.breached);
    }

    #[test]
    fn test_breaches_only_include_reached_thresholds() {
        let breaches = budget_breaches(
            &budgets(),
            "web-prod",
            Some("123456789"),
            &cost(950.0, 900.0),
        );
        let hit: Vec<(&str, f64)> = breaches
            .iter()
            .map(|a| (a.budget_id.as_str(), a.threshold))
            .collect();
        assert_eq!(hit, vec![("b-team", 0.5), ("b-team", 0.9), ("b-all", 1.0)]);
    }

    #[test]
    fn test_zero_budget_is_never_breached() {
        let mut budgets = budgets();
        budgets[1].amount = BudgetAmount::Specified(0.0);
        let alerts = budget_alerts(&budgets[1..2], "p", None, &cost(50.0, 0.0));
        assert_eq!(alerts[0].spend_fraction, 0.0);
        assert!(!alerts[0].breached);
        assert!(budget_breaches(&budgets, "p", None, &cost(0.0, 0.0)).is_empty());
    }
}
