//! Persistent disks and static IP addresses.

use std::collections::HashMap;

use common::{AuditKind, AuditReport, Finding, Priority, Recommendation, Result};
use gcp_client::{GcpClient, Paged};
use serde::Deserialize;
use tracing::{info, instrument};

use crate::thresholds::{DISK_PER_GB_MONTHLY, STATIC_IP_EXTERNAL_MONTHLY};
use crate::{in_regions, is_unlabeled, short_name};

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskAggregatedList {
    #[serde(default)]
    pub items: HashMap<String, DisksScopedList>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Paged for DiskAggregatedList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DisksScopedList {
    #[serde(default)]
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    /// int64 fields arrive as JSON strings.
    #[serde(default)]
    pub size_gb: Option<String>,
    /// Instances the disk is attached to.
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub zone: Option<String>,
    /// Set instead of `zone` for regional disks.
    #[serde(default)]
    pub region: Option<String>,
}

impl Disk {
    fn location(&self) -> &str {
        self.zone
            .as_deref()
            .or(self.region.as_deref())
            .map(short_name)
            .unwrap_or("unknown")
    }

    fn size_gb(&self) -> f64 {
        self.size_gb
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressAggregatedList {
    #[serde(default)]
    pub items: HashMap<String, AddressesScopedList>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl Paged for AddressAggregatedList {
    fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AddressesScopedList {
    #[serde(default)]
    pub addresses: Vec<Address>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub name: String,
    #[serde(default)]
    pub address: String,
    /// `RESERVED` when not attached to anything, `IN_USE` otherwise.
    #[serde(default)]
    pub status: String,
    /// Omitted by the API for external addresses.
    #[serde(default)]
    pub address_type: Option<String>,
    /// Absent for global addresses.
    #[serde(default)]
    pub region: Option<String>,
}

impl Address {
    fn location(&self) -> &str {
        self.region.as_deref().map(short_name).unwrap_or("global")
    }

    fn is_external(&self) -> bool {
        self.address_type.as_deref().unwrap_or("EXTERNAL") == "EXTERNAL"
    }
}

#[derive(Debug, Clone)]
pub struct StorageAuditor {
    client: GcpClient,
}

impl StorageAuditor {
    pub fn new(client: GcpClient) -> Self {
        Self { client }
    }

    #[instrument(skip(self, regions), fields(kind = "storage"))]
    pub async fn audit(&self, project_id: &str, regions: &[String]) -> Result<AuditReport> {
        let query = [("returnPartialSuccess", "true".to_string())];

        let disk_url = format!("{COMPUTE_BASE}/projects/{project_id}/aggregated/disks");
        let disk_pages: Vec<DiskAggregatedList> = self.client.list_all(&disk_url, &query).await?;
        let disks: Vec<Disk> = disk_pages
            .into_iter()
            .flat_map(|page| page.items.into_values())
            .flat_map(|scoped| scoped.disks)
            .filter(|disk| in_regions(disk.location(), regions))
            .collect();

        let address_url = format!("{COMPUTE_BASE}/projects/{project_id}/aggregated/addresses");
        let address_pages: Vec<AddressAggregatedList> =
            self.client.list_all(&address_url, &query).await?;
        let addresses: Vec<Address> = address_pages
            .into_iter()
            .flat_map(|page| page.items.into_values())
            .flat_map(|scoped| scoped.addresses)
            .filter(|address| in_regions(address.location(), regions))
            .collect();

        let report = evaluate(&disks, &addresses);
        info!(
            "Storage audit for {}: {} disk(s), {} address(es), {} idle",
            project_id,
            disks.len(),
            addresses.len(),
            report.idle_count
        );
        Ok(report)
    }
}

pub fn evaluate(disks: &[Disk], addresses: &[Address]) -> AuditReport {
    let mut report = AuditReport {
        total_count: disks.len() + addresses.len(),
        ..AuditReport::default()
    };

    for disk in disks {
        if is_unlabeled(&disk.labels) {
            report.untagged_count += 1;
        }
        if disk.users.is_empty() {
            report.idle_count += 1;
            let size = disk.size_gb();
            report.findings.push(Finding {
                resource_name: disk.name.clone(),
                location: disk.location().to_string(),
                issue: format!("Unattached {size:.0} GB disk"),
            });
            report.recommendations.push(Recommendation::new(
                AuditKind::Storage,
                Priority::High,
                "persistent_disk",
                &disk.name,
                disk.location(),
                "Unattached disk incurring storage costs; snapshot and delete if no longer needed",
                size * DISK_PER_GB_MONTHLY,
            ));
        }
    }

    for address in addresses.iter().filter(|a| a.status == "RESERVED") {
        report.idle_count += 1;
        report.findings.push(Finding {
            resource_name: address.name.clone(),
            location: address.location().to_string(),
            issue: format!("Static IP {} is reserved but unused", address.address),
        });
        if address.is_external() {
            report.recommendations.push(Recommendation::new(
                AuditKind::Storage,
                Priority::Medium,
                "static_ip",
                &address.name,
                address.location(),
                "Unused external static IP incurring charges; release if no longer needed",
                STATIC_IP_EXTERNAL_MONTHLY,
            ));
        }
    }

    report
}
