//! Pairwise version incompatibilities.
//!
//! A constraint `(a, va, b, vb)` forbids any fleet state in which service `a`
//! is at `va` while service `b` is at `vb`. During a round a selected service
//! is live at both its current and its target version, so a selection is
//! checked against three coexistence rules:
//!
//! - **target/target**: two selected services must not land on an
//!   incompatible pair of targets.
//! - **target/unchanged**: a selected target must not clash with the current
//!   version of a service that stays put.
//! - **unchanged/unchanged**: two selected services must not currently sit on
//!   an incompatible pair, since both mutate during the same round.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::versions::CatalogSnapshot;

/// One forbidden `(service, version) x (service, version)` pairing.
///
/// Serialized as a 4-element array: `["a", "va", "b", "vb"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[String; 4]", into = "[String; 4]")]
pub struct Incompatibility {
    pub service_a: String,
    pub version_a: String,
    pub service_b: String,
    pub version_b: String,
}

impl Incompatibility {
    pub fn new(
        service_a: impl Into<String>,
        version_a: impl Into<String>,
        service_b: impl Into<String>,
        version_b: impl Into<String>,
    ) -> Self {
        Self {
            service_a: service_a.into(),
            version_a: version_a.into(),
            service_b: service_b.into(),
            version_b: version_b.into(),
        }
    }

    pub fn involves(&self, service: &str) -> bool {
        self.service_a == service || self.service_b == service
    }
}

impl From<[String; 4]> for Incompatibility {
    fn from([service_a, version_a, service_b, version_b]: [String; 4]) -> Self {
        Self {
            service_a,
            version_a,
            service_b,
            version_b,
        }
    }
}

impl From<Incompatibility> for [String; 4] {
    fn from(c: Incompatibility) -> Self {
        [c.service_a, c.version_a, c.service_b, c.version_b]
    }
}

impl std::fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} x {}@{}",
            self.service_a, self.version_a, self.service_b, self.version_b
        )
    }
}

/// The coexistence rule a selection broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    TargetTarget,
    TargetUnchanged,
    UnchangedUnchanged,
}

/// A constraint broken by a proposed selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: Rule,
    pub constraint: Incompatibility,
}

/// Round-local role of one service while a selection is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot<'a> {
    /// Stays on its current version this round.
    Unchanged,
    /// Moves from its current version to the given target.
    Target(&'a str),
}

/// Evaluate a single constraint given both services' roles.
///
/// `current_a`/`current_b` are the services' current versions.
pub(crate) fn evaluate(
    constraint: &Incompatibility,
    current_a: &str,
    slot_a: Slot<'_>,
    current_b: &str,
    slot_b: Slot<'_>,
) -> Option<Rule> {
    let (va, vb) = (
        constraint.version_a.as_str(),
        constraint.version_b.as_str(),
    );

    match (slot_a, slot_b) {
        (Slot::Target(ta), Slot::Target(tb)) => {
            if ta == va && tb == vb {
                Some(Rule::TargetTarget)
            } else if current_a == va && current_b == vb {
                Some(Rule::UnchangedUnchanged)
            } else {
                None
            }
        }
        (Slot::Target(ta), Slot::Unchanged) => {
            (ta == va && current_b == vb).then_some(Rule::TargetUnchanged)
        }
        (Slot::Unchanged, Slot::Target(tb)) => {
            (current_a == va && tb == vb).then_some(Rule::TargetUnchanged)
        }
        // Neither side moves: the fleet is already in that state.
        (Slot::Unchanged, Slot::Unchanged) => None,
    }
}

/// All stored incompatibilities, indexed by service.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    pairs: Vec<Incompatibility>,
    by_service: BTreeMap<String, Vec<usize>>,
}

impl ConstraintSet {
    pub fn new(pairs: Vec<Incompatibility>) -> Self {
        let mut by_service: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, pair) in pairs.iter().enumerate() {
            by_service
                .entry(pair.service_a.clone())
                .or_default()
                .push(idx);
            if pair.service_b != pair.service_a {
                by_service
                    .entry(pair.service_b.clone())
                    .or_default()
                    .push(idx);
            }
        }
        Self { pairs, by_service }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Incompatibility> {
        self.pairs.iter()
    }

    /// Constraints mentioning `service`.
    pub fn for_service<'a>(&'a self, service: &str) -> impl Iterator<Item = &'a Incompatibility> {
        self.by_service
            .get(service)
            .into_iter()
            .flatten()
            .map(|idx| &self.pairs[*idx])
    }

    /// Every constraint must name catalog services and never pair a service with itself.
    pub fn ensure_known_services(&self, catalog: &CatalogSnapshot) -> Result<(), PlanError> {
        for pair in &self.pairs {
            if pair.service_a == pair.service_b {
                return Err(PlanError::SelfConstraint(pair.service_a.clone()));
            }
            for service in [&pair.service_a, &pair.service_b] {
                if !catalog.contains(service) {
                    return Err(PlanError::UnknownService(service.clone()));
                }
            }
        }
        Ok(())
    }

    /// Load-time validation: services must exist and versions must appear in
    /// the initial version lists.
    pub fn validate(&self, catalog: &CatalogSnapshot) -> Result<(), PlanError> {
        self.ensure_known_services(catalog)?;
        for pair in &self.pairs {
            for (service, version) in [
                (&pair.service_a, &pair.version_a),
                (&pair.service_b, &pair.version_b),
            ] {
                catalog.version_index(service, version)?;
            }
        }
        Ok(())
    }

    /// Check a selection (service -> target) against all three rules.
    ///
    /// Services absent from `selection` stay on their current version.
    /// Constraints naming services outside the catalog are ignored here.
    pub fn first_violation(
        &self,
        catalog: &CatalogSnapshot,
        selection: &BTreeMap<String, String>,
    ) -> Option<Violation> {
        let slot = |service: &str| match selection.get(service) {
            Some(target) => Slot::Target(target.as_str()),
            None => Slot::Unchanged,
        };

        self.pairs.iter().find_map(|pair| {
            let current_a = catalog.current_version(&pair.service_a).ok()?;
            let current_b = catalog.current_version(&pair.service_b).ok()?;
            evaluate(
                pair,
                current_a,
                slot(&pair.service_a),
                current_b,
                slot(&pair.service_b),
            )
            .map(|rule| Violation {
                rule,
                constraint: pair.clone(),
            })
        })
    }

    pub fn is_compatible(
        &self,
        catalog: &CatalogSnapshot,
        selection: &BTreeMap<String, String>,
    ) -> bool {
        self.first_violation(catalog, selection).is_none()
    }
}
