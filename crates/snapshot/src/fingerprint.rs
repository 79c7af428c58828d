//! Cache identity of an `AuditConfig`.

use std::fmt;

use common::AuditConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Normalized tuple of everything that changes what a snapshot contains.
/// Unset and explicitly-default configs produce equal fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConfigFingerprint {
    pub project_id: String,
    pub billing_dataset: String,
    pub table_prefix: String,
    pub regions: Vec<String>,
    pub location: String,
}

pub fn fingerprint(config: &AuditConfig) -> ConfigFingerprint {
    ConfigFingerprint {
        project_id: config.project_id().to_string(),
        billing_dataset: config.billing_dataset().to_string(),
        table_prefix: config.table_prefix().to_string(),
        regions: config.normalized_regions(),
        location: config.location().to_string(),
    }
}

impl ConfigFingerprint {
    /// Short hex digest, stable across processes; used in log lines.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.project_id.as_str(),
            self.billing_dataset.as_str(),
            self.table_prefix.as_str(),
            self.location.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        for region in &self.regions {
            hasher.update(region.as_bytes());
            hasher.update([b',']);
        }
        hasher
            .finalize()
            .iter()
            .take(6)
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.project_id, self.digest())
    }
}
