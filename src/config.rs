//! Configuration loader: merges env vars, .env file, and config.toml.

use std::path::{Path, PathBuf};

use common::config::AppConfig;
use common::{AuditConfig, AuditKind, Error};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

fn parse_positive_u64(raw: &str, env_name: &str) -> Result<u64, Error> {
    let parsed = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer > 0")))?;
    if parsed == 0 {
        return Err(Error::Config(format!("{env_name} must be an integer > 0")));
    }
    Ok(parsed)
}

/// `us-east1, us-central1` → `["us-east1", "us-central1"]`.
pub fn parse_regions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Apply environment overrides; `lookup` is `std::env::var` outside tests.
fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<(), Error>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(project) = lookup("GCP_PROJECT_ID").and_then(non_empty) {
        config.project.project_id = Some(project);
    }
    if let Some(dataset) = lookup("GCP_BILLING_DATASET").and_then(non_empty) {
        config.project.billing_dataset = Some(dataset);
    }
    if let Some(prefix) = lookup("GCP_BILLING_TABLE_PREFIX").and_then(non_empty) {
        config.project.billing_table_prefix = Some(prefix);
    }
    if let Some(regions) = lookup("GCP_REGIONS") {
        let parsed = parse_regions(&regions);
        if !parsed.is_empty() {
            config.project.regions = Some(parsed);
        }
    }
    if let Some(location) = lookup("GCP_BQ_LOCATION").and_then(non_empty) {
        config.project.location = Some(location);
    }
    if let Some(token) = lookup("GCP_ACCESS_TOKEN") {
        config.gcp.access_token = token.trim().to_string();
    }
    if let Some(raw) = lookup("SPENDSCOPE_SNAPSHOT_TTL_SECS") {
        config.cache.snapshot_ttl_secs = parse_positive_u64(&raw, "SPENDSCOPE_SNAPSHOT_TTL_SECS")?;
    }
    if let Some(raw) = lookup("SPENDSCOPE_FORECAST_TTL_SECS") {
        config.cache.forecast_ttl_secs = parse_positive_u64(&raw, "SPENDSCOPE_FORECAST_TTL_SECS")?;
    }
    Ok(())
}

fn validate_config(config: &AppConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();

    if config.gcp.access_token.is_empty() {
        issues.push("GCP_ACCESS_TOKEN is required (set in .env or environment)".into());
    }
    if config.gcp.requests_per_sec == 0 {
        issues.push("gcp.requests_per_sec must be > 0".into());
    }
    if config.gcp.request_timeout_secs == 0 {
        issues.push("gcp.request_timeout_secs must be > 0".into());
    }

    if config.cache.snapshot_ttl_secs == 0 {
        issues.push("cache.snapshot_ttl_secs must be > 0".into());
    }
    if config.cache.forecast_ttl_secs == 0 {
        issues.push("cache.forecast_ttl_secs must be > 0".into());
    }

    if config.timeouts.cost_secs == 0 {
        issues.push("timeouts.cost_secs must be > 0".into());
    }
    if config.timeouts.forecast_secs == 0 {
        issues.push("timeouts.forecast_secs must be > 0".into());
    }
    if config.timeouts.audit_secs == 0 {
        issues.push("timeouts.audit_secs must be > 0".into());
    }
    for kind in AuditKind::ALL {
        if config.timeouts.per_audit.get(&kind) == Some(&0) {
            issues.push(format!("timeouts.per_audit.{kind} must be > 0"));
        }
    }

    issues.extend(config.forecast.issues());

    for (idx, project) in config.projects.iter().enumerate() {
        if project.project_id().is_empty() {
            issues.push(format!("projects[{idx}].project_id is required"));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

fn config_path() -> PathBuf {
    std::env::var("SPENDSCOPE_CONFIG")
        .ok()
        .and_then(non_empty)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn read_file(path: &Path) -> Result<AppConfig, Error> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Load configuration from `.env`, the config file, and the environment.
pub fn load_config() -> Result<AppConfig, Error> {
    // 1. Load .env file from the working directory or its parents.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // 2. Defaults, overlaid by config.toml if present.
    let mut config = read_file(&config_path())?;

    // 3. Environment variables take priority over the file.
    apply_env(&mut config, |name| std::env::var(name).ok())?;

    validate_config(&config)?;
    Ok(config)
}

/// Every `[[projects]]` entry with unset fields inherited from `[project]`.
/// Without entries, the active project alone.
pub fn project_configs(config: &AppConfig) -> Vec<AuditConfig> {
    if config.projects.is_empty() {
        return vec![config.project.clone()];
    }
    let base = &config.project;
    config
        .projects
        .iter()
        .map(|entry| AuditConfig {
            project_id: entry.project_id.clone(),
            billing_dataset: entry
                .billing_dataset
                .clone()
                .or_else(|| base.billing_dataset.clone()),
            billing_table_prefix: entry
                .billing_table_prefix
                .clone()
                .or_else(|| base.billing_table_prefix.clone()),
            regions: entry.regions.clone().or_else(|| base.regions.clone()),
            location: entry.location.clone().or_else(|| base.location.clone()),
            billing_account_id: entry.billing_account_id.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config: AppConfig = toml::from_str(
            r#"
            [project]
            project_id = "from-file"
            billing_dataset = "billing.export"

            [cache]
            snapshot_ttl_secs = 120
            "#,
        )
        .expect("toml parses");

        apply_env(
            &mut config,
            env(&[
                ("GCP_PROJECT_ID", "from-env"),
                ("GCP_REGIONS", "us-east1, europe-west1,,"),
                ("GCP_ACCESS_TOKEN", " ya29.token "),
                ("SPENDSCOPE_FORECAST_TTL_SECS", "7200"),
            ]),
        )
        .expect("env applies");

        assert_eq!(config.project.project_id.as_deref(), Some("from-env"));
        assert_eq!(config.project.billing_dataset.as_deref(), Some("billing.export"));
        assert_eq!(
            config.project.regions,
            Some(vec!["us-east1".to_string(), "europe-west1".to_string()])
        );
        assert_eq!(config.gcp.access_token, "ya29.token");
        assert_eq!(config.cache.snapshot_ttl_secs, 120);
        assert_eq!(config.cache.forecast_ttl_secs, 7200);
    }

    #[test]
    fn test_blank_env_values_are_ignored() {
        let mut config = AppConfig::default();
        config.project.project_id = Some("kept".into());
        apply_env(&mut config, env(&[("GCP_PROJECT_ID", "  "), ("GCP_REGIONS", " , ")]))
            .expect("env applies");
        assert_eq!(config.project.project_id.as_deref(), Some("kept"));
        assert!(config.project.regions.is_none());
    }

    #[test]
    fn test_bad_ttl_is_rejected() {
        let mut config = AppConfig::default();
        let err = apply_env(&mut config, env(&[("SPENDSCOPE_SNAPSHOT_TTL_SECS", "0")]))
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("SPENDSCOPE_SNAPSHOT_TTL_SECS"));
    }

    #[test]
    fn test_validation_reports_every_issue() {
        let mut config = AppConfig::default();
        config.forecast.days = 0;
        config.timeouts.per_audit.insert(AuditKind::Storage, 0);
        config.projects.push(AuditConfig::default());

        let msg = validate_config(&config).unwrap_err().to_string();
        assert!(msg.contains("GCP_ACCESS_TOKEN"));
        assert!(msg.contains("forecast.days"));
        assert!(msg.contains("timeouts.per_audit.storage"));
        assert!(msg.contains("projects[0].project_id"));
    }

    #[test]
    fn test_oversized_forecast_window_is_rejected() {
        let mut config = AppConfig::default();
        config.gcp.access_token = "ya29.token".into();
        assert!(validate_config(&config).is_ok());

        config.forecast.days = 4_000_000_000;
        let err = validate_config(&config).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("forecast.days must be between 1 and 365"));
    }

    #[test]
    fn test_projects_inherit_shared_settings() {
        let config: AppConfig = toml::from_str(
            r#"
            [project]
            project_id = "main"
            billing_dataset = "billing.export"
            location = "EU"

            [[projects]]
            project_id = "p1"
            billing_account_id = "acct-A"

            [[projects]]
            project_id = "p2"
            billing_dataset = "other.export"
            "#,
        )
        .expect("toml parses");

        let projects = project_configs(&config);
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].billing_dataset(), "billing.export");
        assert_eq!(projects[0].location(), "EU");
        assert_eq!(projects[0].billing_account_id.as_deref(), Some("acct-A"));
        assert_eq!(projects[1].billing_dataset(), "other.export");
        assert!(projects[1].billing_account_id.is_none());
    }

    #[test]
    fn test_single_project_without_entries() {
        let mut config = AppConfig::default();
        config.project.project_id = Some("solo".into());
        let projects = project_configs(&config);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].project_id(), "solo");
    }
}
