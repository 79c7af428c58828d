//! Linear-trend cost forecast over the daily billing history.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use common::config::MAX_FORECAST_DAYS;
use common::{BillingScope, CostTrend, ForecastData, ForecastPoint, ForecastSource, Error, Result};
use gcp_client::GcpClient;
use tracing::{info, instrument};

use crate::query::{run_query, DateRange, QueryParameter};
use crate::table::BillingTable;

/// z-score of the two-sided 95% band.
const BAND_Z: f64 = 1.96;

/// Daily slope, relative to the mean daily cost, below which spend is "stable".
const STABLE_SLOPE_RATIO: f64 = 0.005;

#[derive(Debug, Clone)]
pub struct TrendForecastSource {
    client: GcpClient,
}

impl TrendForecastSource {
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }

    async fn daily_history(
        &self,
        scope: &BillingScope,
        range: DateRange,
    ) -> Result<Vec<(NaiveDate, f64)>> {
        let table = BillingTable::new(&scope.billing_dataset, &scope.table_prefix);
        let sql = format!(
            "SELECT FORMAT_DATE('%Y-%m-%d', DATE(usage_start_time)) AS day, SUM(cost) AS total_cost \
             FROM {} WHERE {} AND project.id = @project_id \
             GROUP BY day ORDER BY day",
            table.reference(),
            table.date_filter_sql()
        );
        let mut params = range.params();
        params.push(QueryParameter::string("project_id", scope.project_id.clone()));

        let rows = run_query(
            &self.client,
            table.job_project(&scope.project_id),
            &scope.location,
            &sql,
            params,
        )
        .await?;

        rows.iter()
            .map(|row| {
                let raw = row
                    .text(0)
                    .ok_or_else(|| Error::Query("daily history row without a date".into()))?;
                let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|e| Error::Query(format!("bad date {raw:?}: {e}")))?;
                Ok((day, row.number(1)?))
            })
            .collect()
    }
}

#[async_trait]
impl ForecastSource for TrendForecastSource {
    #[instrument(skip(self, scope), fields(project = %scope.project_id))]
    async fn fetch(
        &self,
        scope: &BillingScope,
        days: u32,
        historical_days: u32,
    ) -> Result<ForecastData> {
        let today = Utc::now().date_naive();
        let history = self
            .daily_history(scope, DateRange::trailing_days(today, historical_days))
            .await?;

        let forecast = project_trend(&history, today, days, historical_days)?;
        info!(
            "Forecast for {}: {:.2} over {} days ({:?}, confidence={:.2})",
            scope.project_id,
            forecast.total_predicted_cost,
            days,
            forecast.trend,
            forecast.model_confidence
        );
        Ok(forecast)
    }
}

/// Fit `cost = a + b * day_index` by least squares and extend it `days`
/// days past `today`. Missing days in `history` count as zero spend.
pub fn project_trend(
    history: &[(NaiveDate, f64)],
    today: NaiveDate,
    days: u32,
    historical_days: u32,
) -> Result<ForecastData> {
    if days == 0 || days > MAX_FORECAST_DAYS {
        return Err(Error::ConfigurationInvalid(format!(
            "forecast days must be between 1 and {MAX_FORECAST_DAYS}, got {days}"
        )));
    }
    let Some(first_day) = history.iter().map(|(d, _)| *d).min() else {
        return Err(Error::Query("no billing history to forecast from".into()));
    };

    let span = (today - first_day).num_days().max(1) as usize;
    let mut series = vec![0.0_f64; span];
    for (day, cost) in history {
        let idx = (*day - first_day).num_days();
        if idx >= 0 && (idx as usize) < span {
            series[idx as usize] += cost;
        }
    }

    let n = series.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let intercept = mean_y - slope * mean_x;

    let (mut ss_res, mut ss_tot) = (0.0, 0.0);
    for (i, y) in series.iter().enumerate() {
        let fitted = intercept + slope * i as f64;
        ss_res += (y - fitted).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }
    let sigma = if n > 2.0 { (ss_res / (n - 2.0)).sqrt() } else { 0.0 };
    let model_confidence = if ss_tot > 0.0 {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    } else {
        // A perfectly flat history is perfectly explained by a flat line.
        1.0
    };

    let trend = if mean_y <= 0.0 || (slope / mean_y).abs() < STABLE_SLOPE_RATIO {
        CostTrend::Stable
    } else if slope > 0.0 {
        CostTrend::Increasing
    } else {
        CostTrend::Decreasing
    };

    let points: Vec<ForecastPoint> = (0..days)
        .map(|offset| {
            let x = (span + offset as usize) as f64;
            let predicted = (intercept + slope * x).max(0.0);
            ForecastPoint {
                date: today + Duration::days(i64::from(offset)),
                predicted_cost: predicted,
                lower_bound: (predicted - BAND_Z * sigma).max(0.0),
                upper_bound: predicted + BAND_Z * sigma,
            }
        })
        .collect();
    let total_predicted_cost = points.iter().map(|p| p.predicted_cost).sum();

    Ok(ForecastData {
        points,
        total_predicted_cost,
        forecast_days: days,
        historical_days,
        model_confidence,
        trend,
        generated_at: Utc::now(),
    })
}
