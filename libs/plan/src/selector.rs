//! Batch selection.
//!
//! Picks, for one round, at most one target per service so that the total
//! version-index advancement is maximal and no coexistence rule is broken.
//! The search is an exact branch-and-bound over services in name order.
//! Each service tries its furthest reachable target first, then nearer
//! ones, then staying put, and only a strictly better score replaces the
//! incumbent. Among equally good selections the first one met in that order
//! wins, which makes the result a pure function of its inputs.
//!
//! Concurrency admission happens after optimization: the optimal candidate
//! map is ranked by expected duration (longest first, ties by name) and only
//! the top `parallelism` services are admitted into the round.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constraints::{evaluate, ConstraintSet, Slot};
use crate::error::PlanError;
use crate::versions::CatalogSnapshot;

/// Maximum number of positions a target may sit past the current version.
pub const LOOKAHEAD: usize = 2;

/// Default cap on explored search nodes before settling for the incumbent.
pub const DEFAULT_SEARCH_BUDGET: u64 = 1_000_000;

/// Expected upgrade duration per service, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationTable(BTreeMap<String, f64>);

impl DurationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_secs(table: BTreeMap<String, f64>) -> Self {
        Self(table)
    }

    pub fn insert(&mut self, service: impl Into<String>, seconds: f64) {
        self.0.insert(service.into(), seconds);
    }

    /// Raw expected duration in seconds.
    pub fn seconds(&self, service: &str) -> Option<f64> {
        self.0.get(service).copied()
    }

    /// Expected duration, or an error if missing, negative or NaN.
    pub fn duration(&self, service: &str) -> Result<Duration, PlanError> {
        let seconds = self
            .seconds(service)
            .ok_or_else(|| PlanError::MissingDuration(service.to_string()))?;
        Duration::try_from_secs_f64(seconds).map_err(|_| PlanError::InvalidDuration {
            service: service.to_string(),
            seconds,
        })
    }

    /// Every catalog service needs a valid duration.
    pub fn validate(&self, catalog: &CatalogSnapshot) -> Result<(), PlanError> {
        for service in catalog.services() {
            self.duration(service)?;
        }
        Ok(())
    }
}

/// Result of one selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// Services admitted into the round, longest expected duration first.
    pub admitted: Vec<String>,

    /// The optimal selection (service -> target), before admission.
    pub candidates: BTreeMap<String, String>,

    /// Sum of the chosen targets' version indices.
    pub score: usize,
}

impl Batch {
    /// An empty batch means there is no legal move this round.
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }

    /// Target of an admitted service.
    pub fn target(&self, service: &str) -> Option<&str> {
        self.admitted
            .iter()
            .any(|s| s == service)
            .then(|| self.candidates.get(service).map(String::as_str))
            .flatten()
    }

    /// `(service, target)` for every admitted service, in admission order.
    pub fn admitted_targets(&self) -> impl Iterator<Item = (&str, &str)> {
        self.admitted.iter().filter_map(|service| {
            self.candidates
                .get(service)
                .map(|target| (service.as_str(), target.as_str()))
        })
    }
}

/// Constrained batch selector.
#[derive(Debug, Clone)]
pub struct BatchSelector {
    lookahead: usize,
    search_budget: u64,
}

impl Default for BatchSelector {
    fn default() -> Self {
        Self {
            lookahead: LOOKAHEAD,
            search_budget: DEFAULT_SEARCH_BUDGET,
        }
    }
}

/// One service the search may move.
struct Movable<'a> {
    name: &'a str,
    current: &'a str,
    /// `(index, version)` options, furthest first.
    options: Vec<(usize, &'a str)>,
}

struct Search<'a> {
    catalog: &'a CatalogSnapshot,
    constraints: &'a ConstraintSet,
    movable: Vec<Movable<'a>>,
    /// Role per service; services outside `movable` stay `Unchanged`.
    slots: BTreeMap<&'a str, Slot<'a>>,
    /// Best achievable score from position `i` onwards.
    suffix_max: Vec<usize>,
    best_score: usize,
    best: Vec<Option<usize>>,
    choice: Vec<Option<usize>>,
    nodes: u64,
    budget: u64,
    exhausted: bool,
}

impl<'a> Search<'a> {
    /// True if assigning `slot` to movable `i` clashes with any already decided service.
    fn conflicts(&self, i: usize, slot: Slot<'a>) -> bool {
        let service = self.movable[i].name;
        let current = self.movable[i].current;

        self.constraints.for_service(service).any(|pair| {
            let (other, self_is_a) = if pair.service_a == service {
                (pair.service_b.as_str(), true)
            } else {
                (pair.service_a.as_str(), false)
            };

            // Undecided partners are checked when they get decided.
            let Some(other_slot) = self.slots.get(other).copied() else {
                return false;
            };
            let Ok(other_current) = self.catalog.current_version(other) else {
                return false;
            };

            if self_is_a {
                evaluate(pair, current, slot, other_current, other_slot).is_some()
            } else {
                evaluate(pair, other_current, other_slot, current, slot).is_some()
            }
        })
    }

    fn run(&mut self, i: usize, score: usize) {
        self.nodes += 1;
        if self.nodes > self.budget {
            self.exhausted = true;
            return;
        }

        if i == self.movable.len() {
            if score > self.best_score {
                self.best_score = score;
                self.best.clone_from(&self.choice);
            }
            return;
        }

        if score + self.suffix_max[i] <= self.best_score {
            return;
        }

        let name = self.movable[i].name;
        for opt in 0..self.movable[i].options.len() {
            let (idx, target) = self.movable[i].options[opt];
            let slot = Slot::Target(target);
            if self.conflicts(i, slot) {
                continue;
            }
            self.slots.insert(name, slot);
            self.choice[i] = Some(opt);
            self.run(i + 1, score + idx);
            self.slots.remove(name);
            self.choice[i] = None;
            if self.exhausted {
                return;
            }
        }

        if !self.conflicts(i, Slot::Unchanged) {
            self.slots.insert(name, Slot::Unchanged);
            self.run(i + 1, score);
            self.slots.remove(name);
        }
    }
}

impl BatchSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of explored search nodes.
    ///
    /// When the cap is hit the best selection found so far is returned; it
    /// is always legal, but may not be optimal.
    pub fn with_search_budget(mut self, budget: u64) -> Self {
        self.search_budget = budget.max(1);
        self
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    /// Choose the upgrade batch for one round.
    ///
    /// Only services whose expected duration is strictly below `remaining`
    /// are considered. Returns an empty batch when no legal move exists;
    /// errors only on malformed input.
    pub fn select(
        &self,
        catalog: &CatalogSnapshot,
        constraints: &ConstraintSet,
        durations: &DurationTable,
        remaining: Duration,
        parallelism: usize,
    ) -> Result<Batch, PlanError> {
        self.select_holding(
            catalog,
            constraints,
            durations,
            remaining,
            parallelism,
            &BTreeSet::new(),
        )
    }

    /// Like [`select`](Self::select), but services in `held` stay on their
    /// current version for this round.
    pub fn select_holding(
        &self,
        catalog: &CatalogSnapshot,
        constraints: &ConstraintSet,
        durations: &DurationTable,
        remaining: Duration,
        parallelism: usize,
        held: &BTreeSet<String>,
    ) -> Result<Batch, PlanError> {
        constraints.ensure_known_services(catalog)?;

        let mut expected = BTreeMap::new();
        let mut movable = Vec::new();
        let mut slots = BTreeMap::new();

        for (name, versions) in catalog.iter() {
            let duration = durations.duration(name)?;
            expected.insert(name, duration);

            let options: Vec<(usize, &str)> = if duration < remaining && !held.contains(name) {
                let mut options: Vec<_> = versions.lookahead(self.lookahead).collect();
                options.reverse();
                options
            } else {
                Vec::new()
            };

            if options.is_empty() {
                slots.insert(name, Slot::Unchanged);
            } else {
                movable.push(Movable {
                    name,
                    current: versions.current(),
                    options,
                });
            }
        }

        let mut suffix_max = vec![0; movable.len() + 1];
        for i in (0..movable.len()).rev() {
            let best_here = movable[i].options.first().map_or(0, |(idx, _)| *idx);
            suffix_max[i] = suffix_max[i + 1] + best_here;
        }

        let count = movable.len();
        let mut search = Search {
            catalog,
            constraints,
            movable,
            slots,
            suffix_max,
            best_score: 0,
            best: vec![None; count],
            choice: vec![None; count],
            nodes: 0,
            budget: self.search_budget,
            exhausted: false,
        };
        search.run(0, 0);

        if search.exhausted {
            warn!(
                nodes = search.nodes,
                best_score = search.best_score,
                "Selection search budget exhausted, using best batch found"
            );
        }

        let candidates: BTreeMap<String, String> = search
            .movable
            .iter()
            .zip(&search.best)
            .filter_map(|(m, choice)| {
                choice.map(|opt| (m.name.to_string(), m.options[opt].1.to_string()))
            })
            .collect();

        let mut ranked: Vec<&String> = candidates.keys().collect();
        ranked.sort_by(|a, b| {
            expected[b.as_str()]
                .cmp(&expected[a.as_str()])
                .then_with(|| a.cmp(b))
        });
        let admitted: Vec<String> = ranked.into_iter().take(parallelism).cloned().collect();

        debug!(
            candidates = candidates.len(),
            admitted = admitted.len(),
            score = search.best_score,
            nodes = search.nodes,
            "Batch selected"
        );

        Ok(Batch {
            admitted,
            candidates,
            score: search.best_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::Incompatibility;

    fn catalog(services: &[(&str, &[&str])]) -> CatalogSnapshot {
        let lists = services
            .iter()
            .map(|(name, versions)| {
                (
                    name.to_string(),
                    versions.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect();
        CatalogSnapshot::from_lists(lists).unwrap()
    }

    fn durations(entries: &[(&str, f64)]) -> DurationTable {
        let mut table = DurationTable::new();
        for (name, secs) in entries {
            table.insert(*name, *secs);
        }
        table
    }

    const SECS_10: Duration = Duration::from_secs(10);

    #[test]
    fn test_selects_furthest_reachable_targets() {
        let catalog = catalog(&[("a", &["v0", "v1", "v2", "v3"]), ("b", &["w0", "w1"])]);
        let batch = BatchSelector::new()
            .select(
                &catalog,
                &ConstraintSet::default(),
                &durations(&[("a", 2.0), ("b", 3.0)]),
                SECS_10,
                2,
            )
            .unwrap();

        assert_eq!(batch.candidates["a"], "v2");
        assert_eq!(batch.candidates["b"], "w1");
        assert_eq!(batch.score, 3);
        // Longest expected duration first.
        assert_eq!(batch.admitted, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_lookahead_never_exceeds_two() {
        let catalog = catalog(&[("a", &["v0", "v1", "v2", "v3", "v4"])]);
        let batch = BatchSelector::new()
            .select(
                &catalog,
                &ConstraintSet::default(),
                &durations(&[("a", 1.0)]),
                SECS_10,
                1,
            )
            .unwrap();

        assert_eq!(batch.target("a"), Some("v2"));
    }

    #[test]
    fn test_held_service_stays_unchanged() {
        let catalog = catalog(&[("a", &["v0", "v1"]), ("b", &["w0", "w1"])]);
        let held: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let batch = BatchSelector::new()
            .select_holding(
                &catalog,
                &ConstraintSet::default(),
                &durations(&[("a", 1.0), ("b", 1.0)]),
                SECS_10,
                2,
                &held,
            )
            .unwrap();

        assert_eq!(batch.admitted, vec!["b".to_string()]);
        assert_eq!(batch.target("a"), None);
    }

    #[test]
    fn test_held_service_still_constrains_partners() {
        // b -> w1 clashes with a staying at v0, and a is held.
        let catalog = catalog(&[("a", &["v0", "v1"]), ("b", &["w0", "w1"])]);
        let constraints = ConstraintSet::new(vec![Incompatibility::new("a", "v0", "b", "w1")]);
        let held: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let batch = BatchSelector::new()
            .select_holding(
                &catalog,
                &constraints,
                &durations(&[("a", 1.0), ("b", 1.0)]),
                SECS_10,
                2,
                &held,
            )
            .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_duration_must_fit_remaining_time() {
        let catalog = catalog(&[("a", &["v0", "v1"]), ("b", &["w0", "w1"])]);
        let table = durations(&[("a", 10.0), ("b", 12.0)]);
        let batch = BatchSelector::new()
            .select(&catalog, &ConstraintSet::default(), &table, SECS_10, 2)
            .unwrap();
        assert!(batch.is_empty());
        assert!(batch.candidates.is_empty());
    }

    #[test]
    fn test_admission_caps_parallelism_after_optimization() {
        let catalog = catalog(&[
            ("a", &["a0", "a1"]),
            ("b", &["b0", "b1"]),
            ("c", &["c0", "c1"]),
        ]);
        let table = durations(&[("a", 1.0), ("b", 5.0), ("c", 3.0)]);
        let batch = BatchSelector::new()
            .select(&catalog, &ConstraintSet::default(), &table, SECS_10, 2)
            .unwrap();

        assert_eq!(batch.candidates.len(), 3);
        assert_eq!(batch.admitted, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(batch.target("a"), None);
    }

    #[test]
    fn test_target_clash_with_unchanged_partner() {
        // a -> v1 is only legal if b leaves w0, but b cannot move (too slow).
        let catalog = catalog(&[("a", &["v0", "v1"]), ("b", &["w0", "w1"])]);
        let constraints = ConstraintSet::new(vec![Incompatibility::new("a", "v1", "b", "w0")]);
        let table = durations(&[("a", 1.0), ("b", 20.0)]);

        let batch = BatchSelector::new()
            .select(&catalog, &constraints, &table, SECS_10, 2)
            .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_target_clash_resolved_by_moving_partner() {
        let catalog = catalog(&[("a", &["v0", "v1"]), ("b", &["w0", "w1"])]);
        let constraints = ConstraintSet::new(vec![Incompatibility::new("a", "v1", "b", "w0")]);
        let table = durations(&[("a", 1.0), ("b", 2.0)]);

        let batch = BatchSelector::new()
            .select(&catalog, &constraints, &table, SECS_10, 2)
            .unwrap();
        assert_eq!(batch.target("a"), Some("v1"));
        assert_eq!(batch.target("b"), Some("w1"));
        assert!(constraints.is_compatible(&catalog, &batch.candidates));
    }

    #[test]
    fn test_unchanged_pair_blocks_joint_move() {
        let catalog = catalog(&[("a", &["v0", "v1"]), ("b", &["w0", "w1", "w2"])]);
        let constraints = ConstraintSet::new(vec![Incompatibility::new("a", "v0", "b", "w0")]);
        let table = durations(&[("a", 1.0), ("b", 1.0)]);

        let batch = BatchSelector::new()
            .select(&catalog, &constraints, &table, SECS_10, 2)
            .unwrap();
        // b alone is worth 2, a alone is worth 1: only b moves.
        assert_eq!(batch.candidates.len(), 1);
        assert_eq!(batch.target("b"), Some("w2"));
    }

    #[test]
    fn test_falls_back_to_nearer_target() {
        let catalog = catalog(&[("a", &["v0", "v1", "v2"]), ("b", &["w0"])]);
        let constraints = ConstraintSet::new(vec![Incompatibility::new("a", "v2", "b", "w0")]);
        let table = durations(&[("a", 1.0), ("b", 1.0)]);

        let batch = BatchSelector::new()
            .select(&catalog, &constraints, &table, SECS_10, 1)
            .unwrap();
        assert_eq!(batch.target("a"), Some("v1"));
    }

    #[test]
    fn test_tie_break_is_by_service_name() {
        // a -> a1 and b -> b1 are mutually exclusive and worth the same.
        let catalog = catalog(&[("a", &["a0", "a1"]), ("b", &["b0", "b1"])]);
        let constraints = ConstraintSet::new(vec![Incompatibility::new("a", "a1", "b", "b1")]);
        let table = durations(&[("a", 1.0), ("b", 1.0)]);
        let selector = BatchSelector::new();

        let first = selector
            .select(&catalog, &constraints, &table, SECS_10, 2)
            .unwrap();
        let second = selector
            .select(&catalog, &constraints, &table, SECS_10, 2)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.admitted, vec!["a".to_string()]);
    }

    #[test]
    fn test_rejects_malformed_input() {
        let catalog = catalog(&[("a", &["v0", "v1"])]);
        let selector = BatchSelector::new();

        let unknown = ConstraintSet::new(vec![Incompatibility::new("a", "v1", "ghost", "g0")]);
        assert_eq!(
            selector.select(&catalog, &unknown, &durations(&[("a", 1.0)]), SECS_10, 1),
            Err(PlanError::UnknownService("ghost".to_string()))
        );

        let negative = durations(&[("a", -1.0)]);
        assert!(matches!(
            selector.select(&catalog, &ConstraintSet::default(), &negative, SECS_10, 1),
            Err(PlanError::InvalidDuration { .. })
        ));

        assert_eq!(
            selector.select(&catalog, &ConstraintSet::default(), &DurationTable::new(), SECS_10, 1),
            Err(PlanError::MissingDuration("a".to_string()))
        );
    }

    #[test]
    fn test_zero_parallelism_admits_nothing() {
        let catalog = catalog(&[("a", &["v0", "v1"])]);
        let batch = BatchSelector::new()
            .select(
                &catalog,
                &ConstraintSet::default(),
                &durations(&[("a", 1.0)]),
                SECS_10,
                0,
            )
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.candidates.len(), 1);
    }

    #[test]
    fn test_exhausted_budget_still_returns_legal_batch() {
        let catalog = catalog(&[
            ("a", &["a0", "a1", "a2"]),
            ("b", &["b0", "b1", "b2"]),
            ("c", &["c0", "c1", "c2"]),
        ]);
        let constraints = ConstraintSet::new(vec![
            Incompatibility::new("a", "a2", "b", "b2"),
            Incompatibility::new("b", "b1", "c", "c0"),
        ]);
        let table = durations(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);

        let batch = BatchSelector::new()
            .with_search_budget(3)
            .select(&catalog, &constraints, &table, SECS_10, 3)
            .unwrap();
        assert!(constraints.is_compatible(&catalog, &batch.candidates));
    }
}
