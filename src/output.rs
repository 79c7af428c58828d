//! Plain summary lines for terminal output.

use billing::BudgetAlert;
use common::{AuditKind, AuditOutcome, ForecastData, Recommendation, Snapshot};
use snapshot::MultiProjectView;

fn degraded_tag(degraded: bool) -> &'static str {
    if degraded {
        " [DEGRADED]"
    } else {
        ""
    }
}

pub fn audit_lines(kind: AuditKind, outcome: &AuditOutcome) -> Vec<String> {
    match outcome {
        AuditOutcome::Failed { error } => vec![format!("  {kind}: FAILED ({})", error.message)],
        AuditOutcome::Completed(report) => {
            let mut lines = vec![format!(
                "  {kind}: {} resources, {} idle, {} untagged, {} over-provisioned, savings ${:.2}/mo",
                report.total_count,
                report.idle_count,
                report.untagged_count,
                report.over_provisioned_count,
                report.potential_savings()
            )];
            lines.extend(report.warnings.iter().map(|w| format!("    warning: {w}")));
            lines
        }
    }
}

pub fn snapshot_lines(snapshot: &Snapshot) -> Vec<String> {
    let cost = &snapshot.cost;
    let mut lines = vec![format!(
        "{} ({}) gen={}{}",
        snapshot.project_id,
        snapshot.billing_month,
        snapshot.generation_id,
        degraded_tag(snapshot.degraded)
    )];

    match &cost.error {
        Some(error) => lines.push(format!("  cost: unavailable ({})", error.message)),
        None => {
            let trend = cost
                .month_over_month_pct()
                .map(|pct| format!(" ({pct:+.1}% vs last month)"))
                .unwrap_or_default();
            lines.push(format!(
                "  cost: ${:.2} this month{}, ${:.2} last month, ${:.2} YTD",
                cost.current_month_cost, trend, cost.last_month_cost, cost.ytd_cost
            ));
            for (service, amount) in cost.services_by_cost().into_iter().take(5) {
                lines.push(format!("    {service}: ${amount:.2}"));
            }
        }
    }

    for (kind, outcome) in &snapshot.audits {
        lines.extend(audit_lines(*kind, outcome));
    }

    if let Some(forecast) = &snapshot.forecast {
        lines.push(forecast_line(forecast));
    } else if let Some(error) = &snapshot.forecast_error {
        lines.push(format!("  forecast: unavailable ({})", error.message));
    }

    lines.push(format!(
        "  {} recommendation(s), potential savings ${:.2}/mo",
        snapshot.recommendation_count(),
        snapshot.total_potential_savings
    ));
    lines.extend(
        snapshot
            .recommendations
            .iter()
            .take(10)
            .map(|rec| format!("  {}", recommendation_line(rec))),
    );
    lines
}

fn recommendation_line(rec: &Recommendation) -> String {
    format!(
        "  [{}] {} {} ({}): {} (${:.2}/mo)",
        rec.priority,
        rec.resource_type,
        rec.resource_name,
        rec.location,
        rec.description,
        rec.potential_monthly_savings
    )
}

pub fn recommendation_lines(recommendations: &[Recommendation]) -> Vec<String> {
    if recommendations.is_empty() {
        return vec!["No matching recommendations".to_string()];
    }
    recommendations.iter().map(recommendation_line).collect()
}

pub fn budget_lines(billing_account_id: &str, alerts: &[BudgetAlert]) -> Vec<String> {
    if alerts.is_empty() {
        return vec![format!("No budget thresholds reached on {billing_account_id}")];
    }
    alerts
        .iter()
        .map(|alert| {
            let name = if alert.budget_name.is_empty() {
                alert.budget_id.as_str()
            } else {
                alert.budget_name.as_str()
            };
            format!(
                "  {}: {:.1}% of {:.2} {} spent, threshold {:.0}% ({}){}",
                name,
                alert.spend_fraction * 100.0,
                alert.budget_amount,
                alert.currency,
                alert.threshold * 100.0,
                alert.spend_basis,
                if alert.breached { " BREACHED" } else { "" }
            )
        })
        .collect()
}

pub fn forecast_line(forecast: &ForecastData) -> String {
    format!(
        "  forecast: ${:.2} over {} days, trend {:?}, confidence {:.2}",
        forecast.total_predicted_cost,
        forecast.forecast_days,
        forecast.trend,
        forecast.model_confidence
    )
}

pub fn view_lines(view: &MultiProjectView) -> Vec<String> {
    let mut lines = Vec::new();
    if view.grouped {
        for group in &view.groups {
            lines.push(format!(
                "{}: {} | ${:.2} this month, savings ${:.2}/mo, {} recommendation(s){}",
                group.billing_account_id.as_deref().unwrap_or("(unknown account)"),
                group.project_ids.join(", "),
                group.current_month_cost,
                group.total_potential_savings,
                group.recommendation_count,
                degraded_tag(group.degraded)
            ));
        }
    } else {
        for entry in &view.projects {
            lines.push(format!(
                "{}: ${:.2} this month, savings ${:.2}/mo{}",
                entry.project_id,
                entry.snapshot.cost.current_month_cost,
                entry.snapshot.total_potential_savings,
                degraded_tag(entry.snapshot.degraded)
            ));
        }
    }
    lines.push(format!(
        "total: ${:.2} this month, savings ${:.2}/mo{}",
        view.total_current_month_cost,
        view.total_potential_savings,
        degraded_tag(view.degraded)
    ));
    lines
}
