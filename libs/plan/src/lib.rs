//! Planning primitives for staged fleet upgrades.
//!
//! This library holds everything about an upgrade round that can be decided
//! without touching a running system:
//!
//! - **Version lists**: each service's ordered versions, current first.
//! - **Constraints**: pairwise `(service, version)` incompatibilities.
//! - **Selection**: choosing a legal, maximal batch of upgrades per round.
//! - **Documents**: the fleet and schedule JSON inputs.
//!
//! # Invariants
//!
//! - Version lists only ever shrink from the front.
//! - Selection is deterministic given the same inputs.
//! - A returned batch never breaks any of the three coexistence rules.

pub mod constraints;
pub mod document;
pub mod error;
pub mod selector;
pub mod versions;

pub use constraints::{ConstraintSet, Incompatibility, Rule, Violation};
pub use document::{
    FleetDocument, FleetPlan, ScheduleDocument, ScheduledTask, TimeWindow, Timeline,
    UpgradeSchedule, VersionPair, WindowLength,
};
pub use error::PlanError;
pub use selector::{Batch, BatchSelector, DurationTable, DEFAULT_SEARCH_BUDGET, LOOKAHEAD};
pub use versions::{CatalogSnapshot, VersionList};
