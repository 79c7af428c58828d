//! Multi-project view with optional grouping by billing account.

use std::sync::Arc;

use common::Snapshot;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectEntry {
    pub project_id: String,
    pub billing_account_id: Option<String>,
    pub snapshot: Arc<Snapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingGroup {
    /// `None` for a project whose billing account is unknown.
    pub billing_account_id: Option<String>,
    pub project_ids: Vec<String>,
    pub current_month_cost: f64,
    pub last_month_cost: f64,
    pub ytd_cost: f64,
    pub total_potential_savings: f64,
    pub recommendation_count: usize,
    /// Some member snapshot is degraded; the sums still include it.
    pub degraded: bool,
}

impl BillingGroup {
    fn new(billing_account_id: Option<String>) -> Self {
        Self {
            billing_account_id,
            project_ids: Vec::new(),
            current_month_cost: 0.0,
            last_month_cost: 0.0,
            ytd_cost: 0.0,
            total_potential_savings: 0.0,
            recommendation_count: 0,
            degraded: false,
        }
    }

    fn add(&mut self, entry: &ProjectEntry) {
        let snapshot = &entry.snapshot;
        self.project_ids.push(entry.project_id.clone());
        self.current_month_cost += snapshot.cost.current_month_cost;
        self.last_month_cost += snapshot.cost.last_month_cost;
        self.ytd_cost += snapshot.cost.ytd_cost;
        self.total_potential_savings += snapshot.total_potential_savings;
        self.recommendation_count += snapshot.recommendation_count();
        self.degraded |= snapshot.degraded;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiProjectView {
    pub projects: Vec<ProjectEntry>,
    /// Empty unless grouping was requested.
    pub groups: Vec<BillingGroup>,
    pub grouped: bool,
    pub total_current_month_cost: f64,
    pub total_potential_savings: f64,
    pub degraded: bool,
}

/// Groups appear in first-appearance order. Entries without a billing
/// account each get a group of their own.
pub fn combine(entries: Vec<ProjectEntry>, group_by_billing_account: bool) -> MultiProjectView {
    let mut groups: Vec<BillingGroup> = Vec::new();

    if group_by_billing_account {
        for entry in &entries {
            let existing = entry.billing_account_id.as_ref().and_then(|account| {
                groups
                    .iter()
                    .position(|g| g.billing_account_id.as_ref() == Some(account))
            });
            match existing {
                Some(idx) => groups[idx].add(entry),
                None => {
                    let mut group = BillingGroup::new(entry.billing_account_id.clone());
                    group.add(entry);
                    groups.push(group);
                }
            }
        }
    }

    MultiProjectView {
        total_current_month_cost: entries
            .iter()
            .map(|e| e.snapshot.cost.current_month_cost)
            .sum(),
        total_potential_savings: entries
            .iter()
            .map(|e| e.snapshot.total_potential_savings)
            .sum(),
        degraded: entries.iter().any(|e| e.snapshot.degraded),
        projects: entries,
        groups,
        grouped: group_by_billing_account,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{AuditKind, CostFigures, Priority, ProducerError, ProducerKind, Recommendation};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn entry(project: &str, account: Option<&str>, cost: f64, savings: f64) -> ProjectEntry {
        let recommendations = vec![Recommendation::new(
            AuditKind::Storage,
            Priority::High,
            "persistent_disk",
            format!("{project}-disk"),
            "us-central1-a",
            "unattached",
            savings,
        )];
        ProjectEntry {
            project_id: project.to_string(),
            billing_account_id: account.map(str::to_string),
            snapshot: Arc::new(Snapshot {
                project_id: project.to_string(),
                billing_month: "2026-10".into(),
                cost: CostFigures {
                    current_month_cost: cost,
                    last_month_cost: cost / 2.0,
                    ytd_cost: cost * 10.0,
                    ..CostFigures::default()
                },
                audits: BTreeMap::new(),
                recommendations,
                total_potential_savings: savings,
                forecast: None,
                forecast_error: None,
                created_at: Utc::now(),
                generation_id: 1,
                degraded: false,
            }),
        }
    }

    #[test]
    fn test_projects_sharing_an_account_are_summed() {
        let view = combine(
            vec![
                entry("p1", Some("acct-A"), 100.0, 10.0),
                entry("p2", Some("acct-B"), 7.0, 1.0),
                entry("p3", Some("acct-A"), 50.0, 5.0),
            ],
            true,
        );

        assert!(view.grouped);
        assert_eq!(view.groups.len(), 2);
        let a = &view.groups[0];
        assert_eq!(a.billing_account_id.as_deref(), Some("acct-A"));
        assert_eq!(a.project_ids, vec!["p1", "p3"]);
        assert_eq!(a.current_month_cost, 150.0);
        assert_eq!(a.total_potential_savings, 15.0);
        assert_eq!(a.recommendation_count, 2);
        assert_eq!(view.groups[1].billing_account_id.as_deref(), Some("acct-B"));
        assert_eq!(view.total_current_month_cost, 157.0);
    }

    #[test]
    fn test_unknown_accounts_form_singleton_groups() {
        let view = combine(
            vec![
                entry("p1", None, 1.0, 0.0),
                entry("p2", None, 2.0, 0.0),
                entry("p3", Some("acct-A"), 3.0, 0.0),
            ],
            true,
        );
        assert_eq!(view.groups.len(), 3);
        assert_eq!(view.groups[0].project_ids, vec!["p1"]);
        assert_eq!(view.groups[1].project_ids, vec!["p2"]);
        assert!(view.groups[0].billing_account_id.is_none());
    }

    #[test]
    fn test_ungrouped_view_keeps_entries_in_order() {
        let view = combine(
            vec![entry("p2", Some("acct-A"), 1.0, 0.0), entry("p1", Some("acct-A"), 2.0, 0.0)],
            false,
        );
        assert!(!view.grouped);
        assert!(view.groups.is_empty());
        let order: Vec<&str> = view.projects.iter().map(|p| p.project_id.as_str()).collect();
        assert_eq!(order, vec!["p2", "p1"]);
    }

    #[test]
    fn test_degraded_member_flags_its_group() {
        let healthy = entry("p1", Some("acct-A"), 100.0, 10.0);
        let mut broken = entry("p2", Some("acct-A"), 0.0, 0.0);
        let snapshot = Arc::make_mut(&mut broken.snapshot);
        snapshot.cost = CostFigures::degraded(ProducerError::timeout(
            ProducerKind::Cost,
            Duration::from_secs(60),
        ));
        snapshot.degraded = true;

        let view = combine(vec![healthy, broken], true);
        assert_eq!(view.groups.len(), 1);
        assert!(view.groups[0].degraded);
        assert_eq!(view.groups[0].project_ids.len(), 2);
        assert_eq!(view.groups[0].current_month_cost, 100.0);
        assert!(view.degraded);
    }
}
