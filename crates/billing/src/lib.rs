//! Billing producers backed by the BigQuery billing export.
//!
//! `BigQueryCostSource` answers cost figures and billing-account lookups;
//! `TrendForecastSource` projects daily spend forward; `BudgetClient` checks
//! billing budgets against a month's spend.

pub mod budget;
pub mod cost;
pub mod forecast;
pub mod query;
pub mod table;

pub use budget::{Budget, BudgetAlert, BudgetClient};
pub use cost::BigQueryCostSource;
pub use forecast::TrendForecastSource;
pub use table::BillingTable;
