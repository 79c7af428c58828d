//! Producer capabilities consumed by the orchestrator.
//!
//! Each producer is a black box with one `fetch` operation. Implementations
//! own their clients; nothing here is shared between concurrent runs.

use async_trait::async_trait;

use crate::types::{AuditKind, AuditReport, BillingScope, CostFigures, ForecastData};
use crate::Result;

#[async_trait]
pub trait CostSource: Send + Sync + 'static {
    /// Current month, last month, year-to-date and per-service costs.
    async fn fetch(&self, scope: &BillingScope) -> Result<CostFigures>;

    /// Billing account the project is charged to, if any.
    async fn billing_account(&self, _project_id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
pub trait AuditSource: Send + Sync + 'static {
    fn kind(&self) -> AuditKind;

    async fn fetch(&self, project_id: &str, regions: &[String]) -> Result<AuditReport>;
}

#[async_trait]
pub trait ForecastSource: Send + Sync + 'static {
    async fn fetch(
        &self,
        scope: &BillingScope,
        days: u32,
        historical_days: u32,
    ) -> Result<ForecastData>;
}
