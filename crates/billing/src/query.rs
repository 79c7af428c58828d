//! Minimal BigQuery `jobs.query` support.

use chrono::{Datelike, Duration, NaiveDate};
use common::Error;
use gcp_client::GcpClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

const BIGQUERY_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Server-side wait before `jobs.query` returns an incomplete job.
const QUERY_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    location: &'a str,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter>,
    timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameter {
    name: String,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

#[derive(Debug, Clone, Serialize)]
struct ParameterType {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ParameterValue {
    value: String,
}

impl QueryParameter {
    pub fn string(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType { kind: "STRING" },
            parameter_value: ParameterValue {
                value: value.into(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    #[serde(default)]
    pub job_complete: bool,
    #[serde(default)]
    pub rows: Vec<Row>,
}

#[derive(Debug, Deserialize)]
pub struct Row {
    #[serde(default)]
    pub f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
pub struct Cell {
    #[serde(default)]
    pub v: Option<serde_json::Value>,
}

impl Row {
    /// Cell `idx` as a string; BigQuery encodes every scalar as a JSON string.
    pub fn text(&self, idx: usize) -> Option<&str> {
        self.f.get(idx)?.v.as_ref()?.as_str()
    }

    /// Cell `idx` parsed as a float. NULL (e.g. `SUM` over no rows) is zero.
    pub fn number(&self, idx: usize) -> Result<f64, Error> {
        match self.text(idx) {
            None => Ok(0.0),
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| Error::Query(format!("column {idx} is not numeric: {raw:?}"))),
        }
    }
}

/// Run a standard-SQL query and return its rows.
pub async fn run_query(
    client: &GcpClient,
    job_project: &str,
    location: &str,
    sql: &str,
    parameters: Vec<QueryParameter>,
) -> Result<Vec<Row>, Error> {
    let url = format!("{BIGQUERY_BASE}/projects/{job_project}/queries");
    let request = QueryRequest {
        query: sql,
        use_legacy_sql: false,
        location,
        parameter_mode: "NAMED",
        query_parameters: parameters,
        timeout_ms: QUERY_TIMEOUT_MS,
    };

    let resp: QueryResponse = client.post_json(&url, &request).await?;
    if !resp.job_complete {
        return Err(Error::Query(format!(
            "query job in {job_project} did not complete within {QUERY_TIMEOUT_MS}ms"
        )));
    }
    debug!("BigQuery returned {} row(s)", resp.rows.len());
    Ok(resp.rows)
}

/// Inclusive date range rendered as `YYYYMMDD`, the shard-suffix format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn params(&self) -> Vec<QueryParameter> {
        vec![
            QueryParameter::string("start_date", self.start.format("%Y%m%d").to_string()),
            QueryParameter::string("end_date", self.end.format("%Y%m%d").to_string()),
        ]
    }

    pub fn current_month(today: NaiveDate) -> Self {
        Self {
            start: today.with_day(1).unwrap_or(today),
            end: today,
        }
    }

    pub fn last_month(today: NaiveDate) -> Self {
        let first_of_this = today.with_day(1).unwrap_or(today);
        let end = first_of_this - Duration::days(1);
        Self {
            start: end.with_day(1).unwrap_or(end),
            end,
        }
    }

    pub fn year_to_date(today: NaiveDate) -> Self {
        Self {
            start: NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today),
            end: today,
        }
    }

    /// The `days` days ending yesterday; today is still accruing.
    pub fn trailing_days(today: NaiveDate, days: u32) -> Self {
        let end = today - Duration::days(1);
        Self {
            start: end - Duration::days(i64::from(days.max(1)) - 1),
            end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn test_month_ranges_across_year_boundary() {
        let today = date(2026, 1, 14);
        assert_eq!(
            DateRange::current_month(today),
            DateRange { start: date(2026, 1, 1), end: today }
        );
        assert_eq!(
            DateRange::last_month(today),
            DateRange { start: date(2025, 12, 1), end: date(2025, 12, 31) }
        );
        assert_eq!(DateRange::year_to_date(today).start, date(2026, 1, 1));
    }

    #[test]
    fn test_last_month_handles_short_february() {
        let range = DateRange::last_month(date(2026, 3, 31));
        assert_eq!(range.start, date(2026, 2, 1));
        assert_eq!(range.end, date(2026, 2, 28));
    }

    #[test]
    fn test_trailing_days_excludes_today() {
        let range = DateRange::trailing_days(date(2026, 10, 16), 7);
        assert_eq!(range.end, date(2026, 10, 15));
        assert_eq!(range.start, date(2026, 10, 9));
    }

    #[test]
    fn test_params_use_shard_suffix_format() {
        let params = serde_json::to_value(DateRange::current_month(date(2026, 10, 16)).params())
            .expect("params serialize");
        assert_eq!(params[0]["name"], "start_date");
        assert_eq!(params[0]["parameterValue"]["value"], "20261001");
        assert_eq!(params[1]["parameterValue"]["value"], "20261016");
        assert_eq!(params[1]["parameterType"]["type"], "STRING");
    }

    #[test]
    fn test_row_cells_parse() {
        let resp: QueryResponse = serde_json::from_str(
            r#"{"jobComplete": true, "rows": [{"f": [{"v": "Compute Engine"}, {"v": "12.5"}]}, {"f": [{"v": null}, {"v": null}]}]}"#,
        )
        .expect("response parses");
        assert_eq!(resp.rows[0].text(0), Some("Compute Engine"));
        assert_eq!(resp.rows[0].number(1).unwrap(), 12.5);
        assert_eq!(resp.rows[1].number(1).unwrap(), 0.0);
        assert!(resp.rows[0].number(0).is_err());
    }
}
