//! Per-service version lists and catalog snapshots.
//!
//! A version list always starts at the service's current version. Advancing
//! a service truncates the list from the front, so a list never again holds
//! a version ordered before its head.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PlanError;

/// Ordered versions of one service, current version first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VersionList(Vec<String>);

impl VersionList {
    /// Build a version list, rejecting empty or duplicated lists.
    pub fn new(service: &str, versions: Vec<String>) -> Result<Self, PlanError> {
        if versions.is_empty() {
            return Err(PlanError::EmptyVersions(service.to_string()));
        }

        let mut seen = HashSet::with_capacity(versions.len());
        for version in &versions {
            if !seen.insert(version.as_str()) {
                return Err(PlanError::DuplicateVersion {
                    service: service.to_string(),
                    version: version.clone(),
                });
            }
        }

        Ok(Self(versions))
    }

    /// The current version (always index 0).
    pub fn current(&self) -> &str {
        &self.0[0]
    }

    /// The newest known version.
    pub fn final_version(&self) -> &str {
        &self.0[self.0.len() - 1]
    }

    /// True once the service sits on its newest version.
    pub fn is_final(&self) -> bool {
        self.0.len() == 1
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    /// Position of `version` relative to the current head.
    pub fn position(&self, version: &str) -> Option<usize> {
        self.0.iter().position(|v| v == version)
    }

    pub fn contains(&self, version: &str) -> bool {
        self.position(version).is_some()
    }

    /// Versions reachable in one step, nearest first: indices `1..=bound`.
    pub fn lookahead(&self, bound: usize) -> impl Iterator<Item = (usize, &str)> {
        self.0
            .iter()
            .enumerate()
            .skip(1)
            .take(bound)
            .map(|(idx, v)| (idx, v.as_str()))
    }

    /// Truncate the list so `target` becomes the head.
    pub fn advance_to(&mut self, service: &str, target: &str) -> Result<(), PlanError> {
        let idx = self
            .position(target)
            .ok_or_else(|| PlanError::UnknownVersion {
                service: service.to_string(),
                version: target.to_string(),
            })?;

        if idx == 0 {
            return Err(PlanError::NotAhead {
                service: service.to_string(),
                current: self.current().to_string(),
                target: target.to_string(),
            });
        }

        self.0.drain(..idx);
        Ok(())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// An immutable view of every service's version list at one instant.
///
/// The batch selector only ever reads snapshots; the live catalog hands one
/// out before each round so that no in-flight change leaks into selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CatalogSnapshot {
    services: BTreeMap<String, VersionList>,
}

impl CatalogSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from raw version lists.
    pub fn from_lists(lists: BTreeMap<String, Vec<String>>) -> Result<Self, PlanError> {
        let mut snapshot = Self::new();
        for (service, versions) in lists {
            let list = VersionList::new(&service, versions)?;
            snapshot.insert(service, list);
        }
        Ok(snapshot)
    }

    pub fn insert(&mut self, service: impl Into<String>, versions: VersionList) {
        self.services.insert(service.into(), versions);
    }

    pub fn get(&self, service: &str) -> Option<&VersionList> {
        self.services.get(service)
    }

    /// Version list for `service`, or `UnknownService`.
    pub fn versions(&self, service: &str) -> Result<&VersionList, PlanError> {
        self.services
            .get(service)
            .ok_or_else(|| PlanError::UnknownService(service.to_string()))
    }

    pub fn current_version(&self, service: &str) -> Result<&str, PlanError> {
        Ok(self.versions(service)?.current())
    }

    /// Index of `version` in the service's list (0 = current).
    pub fn version_index(&self, service: &str, version: &str) -> Result<usize, PlanError> {
        self.versions(service)?
            .position(version)
            .ok_or_else(|| PlanError::UnknownVersion {
                service: service.to_string(),
                version: version.to_string(),
            })
    }

    /// Advance `service` so that `target` becomes its current version.
    pub fn advance(&mut self, service: &str, target: &str) -> Result<(), PlanError> {
        self.services
            .get_mut(service)
            .ok_or_else(|| PlanError::UnknownService(service.to_string()))?
            .advance_to(service, target)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Service names in lexicographic order.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VersionList)> {
        self.services.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Services that have not reached their final version.
    pub fn pending_services(&self) -> impl Iterator<Item = &str> {
        self.iter()
            .filter(|(_, versions)| !versions.is_final())
            .map(|(service, _)| service)
    }

    /// True when every service sits on its final version.
    pub fn is_complete(&self) -> bool {
        self.services.values().all(VersionList::is_final)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn into_lists(self) -> BTreeMap<String, VersionList> {
        self.services
    }
}

/// Deserialized snapshots go through the same checks as [`CatalogSnapshot::from_lists`].
impl<'de> Deserialize<'de> for CatalogSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let lists = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
        Self::from_lists(lists).map_err(serde::de::Error::custom)
    }
}
