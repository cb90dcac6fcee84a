//! Live version catalog shared by the scheduler and its upgrade tasks.
//!
//! Each service's version list sits behind its own lock, so reading one
//! service never waits on another service's advancement. Only the task that
//! owns a service's in-flight upgrade advances it, and only on success.

use std::collections::BTreeMap;

use fleetup_plan::{CatalogSnapshot, PlanError, VersionList};
use tokio::sync::RwLock;
use tracing::info;

/// Version catalog with per-service locking.
#[derive(Debug)]
pub struct VersionCatalog {
    services: BTreeMap<String, RwLock<VersionList>>,
}

impl VersionCatalog {
    /// Create a live catalog from a snapshot.
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        let services = snapshot
            .into_lists()
            .into_iter()
            .map(|(service, versions)| (service, RwLock::new(versions)))
            .collect();
        Self { services }
    }

    fn entry(&self, service: &str) -> Result<&RwLock<VersionList>, PlanError> {
        self.services
            .get(service)
            .ok_or_else(|| PlanError::UnknownService(service.to_string()))
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Service names in lexicographic order.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub async fn current_version(&self, service: &str) -> Result<String, PlanError> {
        let versions = self.entry(service)?.read().await;
        Ok(versions.current().to_string())
    }

    pub async fn version_index(&self, service: &str, version: &str) -> Result<usize, PlanError> {
        let versions = self.entry(service)?.read().await;
        versions
            .position(version)
            .ok_or_else(|| PlanError::UnknownVersion {
                service: service.to_string(),
                version: version.to_string(),
            })
    }

    /// Make `target` the service's current version.
    pub async fn advance(&self, service: &str, target: &str) -> Result<(), PlanError> {
        let mut versions = self.entry(service)?.write().await;
        let previous = versions.current().to_string();
        versions.advance_to(service, target)?;

        info!(
            service = %service,
            from = %previous,
            to = %target,
            remaining = versions.len() - 1,
            "Catalog advanced"
        );
        Ok(())
    }

    /// Copy every version list.
    ///
    /// Rounds never overlap, so a snapshot taken between rounds is consistent.
    pub async fn snapshot(&self) -> CatalogSnapshot {
        let mut snapshot = CatalogSnapshot::new();
        for (service, versions) in &self.services {
            snapshot.insert(service.clone(), versions.read().await.clone());
        }
        snapshot
    }

    /// True when every service has reached its final version.
    pub async fn is_complete(&self) -> bool {
        for versions in self.services.values() {
            if !versions.read().await.is_final() {
                return false;
            }
        }
        true
    }
}
