//! Live configuration with change notification.

use std::sync::Arc;

use common::AuditConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::SnapshotCache;
use crate::fingerprint::fingerprint;

/// Holds the current `AuditConfig`; subscribers see every change.
#[derive(Debug)]
pub struct ConfigProvider {
    tx: watch::Sender<AuditConfig>,
}

impl ConfigProvider {
    pub fn new(initial: AuditConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> AuditConfig {
        self.tx.borrow().clone()
    }

    /// Replace the config. Returns false (and notifies nobody) when it is
    /// unchanged.
    pub fn update(&self, config: AuditConfig) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == config {
                false
            } else {
                *current = config;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<AuditConfig> {
        self.tx.subscribe()
    }
}

/// Invalidate the previous and the new fingerprint on every config change.
/// The task ends once the provider is dropped.
pub fn spawn_invalidation_listener(
    cache: Arc<SnapshotCache>,
    mut rx: watch::Receiver<AuditConfig>,
) -> JoinHandle<()> {
    let mut previous = fingerprint(&rx.borrow_and_update());
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let next = fingerprint(&rx.borrow_and_update());
            cache.invalidate(&previous);
            if next != previous {
                cache.invalidate(&next);
            }
            info!("Config changed ({} -> {}); cache invalidated", previous, next);
            previous = next;
        }
    })
}
