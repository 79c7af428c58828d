//! Billing export table layout detection.
//!
//! The export comes in two shapes:
//! - daily-sharded tables (`gcp_billing_export_v1_20260201`), queried with a
//!   wildcard and filtered on `_TABLE_SUFFIX`;
//! - one partitioned table per billing account
//!   (`gcp_billing_export_v1_0148A9_A6130F_E0294F`), filtered on
//!   `usage_start_time`.

use common::config::DEFAULT_TABLE_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingTable {
    dataset: String,
    prefix: String,
}

impl BillingTable {
    pub fn new(dataset: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            prefix: prefix.into(),
        }
    }

    /// True when `prefix` names one partitioned table rather than a shard prefix.
    pub fn is_single_partitioned(&self) -> bool {
        let marker = format!("{DEFAULT_TABLE_PREFIX}_");
        let Some(suffix) = self.prefix.strip_prefix(&marker) else {
            return false;
        };
        // A daily shard suffix is an 8-digit date.
        !(suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_digit()))
    }

    /// Fully qualified, backtick-quoted table reference for `FROM`.
    pub fn reference(&self) -> String {
        if self.is_single_partitioned() {
            format!("`{}.{}`", self.dataset, self.prefix)
        } else {
            format!("`{}.{}*`", self.dataset, self.prefix)
        }
    }

    /// Date predicate over `@start_date` / `@end_date` (YYYYMMDD strings).
    pub fn date_filter_sql(&self) -> &'static str {
        if self.is_single_partitioned() {
            "FORMAT_DATE('%Y%m%d', DATE(usage_start_time)) BETWEEN @start_date AND @end_date"
        } else {
            "_TABLE_SUFFIX BETWEEN @start_date AND @end_date"
        }
    }

    /// Project that should run the query job: the dataset's own project when
    /// the dataset is qualified as `project.dataset`, else `fallback`.
    pub fn job_project<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self.dataset.split_once('.') {
            Some((project, _)) if !project.is_empty() => project,
            _ => fallback,
        }
    }
}
