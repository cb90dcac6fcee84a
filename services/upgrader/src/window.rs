//! Window scheduler.
//!
//! Drives rounds inside a wall-clock window:
//!
//! ```text
//! awaiting-admission -> selecting -> executing -> draining -> (next round | closed)
//! ```
//!
//! Every round selects from a catalog snapshot taken before any of its tasks
//! start, launches the admitted services concurrently and joins all of them
//! before the next selection. Rounds never overlap. A service that fails is
//! held on its current version for the rest of the window.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use fleetup_plan::{
    BatchSelector, ConstraintSet, DurationTable, FleetPlan, PlanError, DEFAULT_SEARCH_BUDGET,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::executor::{ExecutorError, TaskExecutor, TaskResult, UpgradeTask};
use crate::gate::{AdmissionGate, AlwaysAdmit};

/// Window scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wall-clock length of each window.
    pub window_length: Duration,

    /// Stop after this many windows. `None` runs until the fleet is done.
    pub max_windows: Option<u32>,

    /// Overrides the fleet document's parallelism.
    pub parallelism: Option<usize>,

    /// Node cap for one selection search.
    pub search_budget: u64,

    /// Pause between windows.
    pub window_gap: Duration,

    /// Stop after this many consecutive windows without a single success.
    pub max_idle_windows: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_length: Duration::from_secs(20),
            max_windows: None,
            parallelism: None,
            search_budget: DEFAULT_SEARCH_BUDGET,
            window_gap: Duration::ZERO,
            max_idle_windows: 3,
        }
    }
}

/// Where the current window is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPhase {
    AwaitingAdmission,
    Selecting,
    Executing,
    Draining,
    Closed,
}

/// Why a window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// No wall-clock time left.
    Expired,
    /// The admission gate said no.
    AdmissionRejected,
    /// The selector found nothing legal to do.
    NoLegalBatch,
    /// Every service is on its final version.
    FleetComplete,
}

/// Bookkeeping for one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub round: u32,

    /// Admitted `service -> target`.
    pub targets: BTreeMap<String, String>,

    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub elapsed_ms: u64,
}

/// Summary of one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    pub window_id: String,
    pub rounds: Vec<RoundReport>,
    pub launched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub close_reason: CloseReason,
}

impl WindowReport {
    fn new(window_id: &str) -> Self {
        Self {
            window_id: window_id.to_string(),
            rounds: Vec::new(),
            launched: 0,
            succeeded: 0,
            failed: 0,
            close_reason: CloseReason::Expired,
        }
    }
}

/// Scheduler errors. Only malformed planning input stops a window.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),
}

/// Runs optimizer-driven windows over a fleet.
pub struct WindowScheduler {
    executor: TaskExecutor,
    constraints: ConstraintSet,
    durations: DurationTable,
    parallelism: usize,
    selector: BatchSelector,
    gate: Arc<dyn AdmissionGate>,
    config: SchedulerConfig,
    phase: watch::Sender<WindowPhase>,
}

impl WindowScheduler {
    /// Create a scheduler. The executor's catalog must have been built from
    /// `plan.catalog`.
    pub fn new(executor: TaskExecutor, plan: FleetPlan, config: SchedulerConfig) -> Self {
        let (phase, _) = watch::channel(WindowPhase::Closed);
        Self {
            executor,
            constraints: plan.constraints,
            durations: plan.durations,
            parallelism: config.parallelism.unwrap_or(plan.parallelism),
            selector: BatchSelector::new().with_search_budget(config.search_budget),
            gate: Arc::new(AlwaysAdmit),
            config,
            phase,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Follow phase changes.
    pub fn subscribe(&self) -> watch::Receiver<WindowPhase> {
        self.phase.subscribe()
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn enter(&self, phase: WindowPhase) {
        debug!(phase = ?phase, "Window phase");
        self.phase.send_replace(phase);
    }

    /// Run windows until the fleet is complete or no more progress is possible.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<Vec<WindowReport>, SchedulerError> {
        info!(
            backend = self.executor.backend_name(),
            parallelism = self.parallelism,
            window_secs = self.config.window_length.as_secs_f64(),
            "Starting upgrade run"
        );

        let mut reports = Vec::new();
        let mut idle = 0;
        let mut index = 0;

        loop {
            if self.executor.catalog().is_complete().await {
                info!(windows = reports.len(), "Fleet fully upgraded");
                break;
            }
            if self.config.max_windows.is_some_and(|max| index >= max) {
                info!(windows = index, "Window limit reached");
                break;
            }

            index += 1;
            let report = self.run_window(&format!("window-{index}")).await?;

            idle = if report.succeeded == 0 { idle + 1 } else { 0 };
            let stop = match report.close_reason {
                CloseReason::AdmissionRejected | CloseReason::FleetComplete => true,
                CloseReason::NoLegalBatch => report.launched == 0,
                CloseReason::Expired => false,
            };
            reports.push(report);

            if stop {
                break;
            }
            if idle >= self.config.max_idle_windows {
                warn!(idle_windows = idle, "No progress in recent windows, giving up");
                break;
            }
            if !self.config.window_gap.is_zero() {
                tokio::time::sleep(self.config.window_gap).await;
            }
        }

        Ok(reports)
    }

    /// Run rounds inside one window.
    #[instrument(skip(self))]
    pub async fn run_window(&self, window_id: &str) -> Result<WindowReport, SchedulerError> {
        let deadline = Instant::now() + self.config.window_length;
        let mut report = WindowReport::new(window_id);
        let mut round = 0u32;
        let mut held = BTreeSet::new();

        info!(
            window_secs = self.config.window_length.as_secs_f64(),
            "Window opened"
        );

        let reason = loop {
            if self.executor.catalog().is_complete().await {
                break CloseReason::FleetComplete;
            }
            if deadline <= Instant::now() {
                break CloseReason::Expired;
            }

            self.enter(WindowPhase::AwaitingAdmission);
            if !self.gate.admit(window_id, round + 1).await {
                break CloseReason::AdmissionRejected;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break CloseReason::Expired;
            }

            self.enter(WindowPhase::Selecting);
            let snapshot = self.executor.catalog().snapshot().await;
            let batch = self.selector.select_holding(
                &snapshot,
                &self.constraints,
                &self.durations,
                remaining,
                self.parallelism,
                &held,
            )?;
            if batch.is_empty() {
                info!(
                    remaining_ms = remaining.as_millis() as u64,
                    held = ?held,
                    "No legal batch"
                );
                break CloseReason::NoLegalBatch;
            }

            round += 1;
            self.enter(WindowPhase::Executing);
            let round_started = Instant::now();
            let mut targets = BTreeMap::new();
            let mut tasks = JoinSet::new();

            for (service, target) in batch.admitted_targets() {
                let task = UpgradeTask::new(
                    service,
                    snapshot.current_version(service)?,
                    target,
                    self.durations.duration(service)?,
                )
                .in_round(window_id, round);
                targets.insert(service.to_string(), target.to_string());

                let executor = self.executor.clone();
                tasks.spawn(async move { executor.run_upgrade(task, deadline).await });
            }

            info!(
                round,
                launched = targets.len(),
                score = batch.score,
                targets = ?targets,
                "Round started"
            );
            report.launched += targets.len();

            self.enter(WindowPhase::Draining);
            let mut round_report = RoundReport {
                round,
                targets,
                succeeded: Vec::new(),
                failed: Vec::new(),
                elapsed_ms: 0,
            };
            while let Some(joined) = tasks.join_next().await {
                Self::tally(&mut round_report, joined);
            }
            round_report.succeeded.sort();
            round_report.failed.sort();
            round_report.elapsed_ms = round_started.elapsed().as_millis() as u64;

            report.succeeded += round_report.succeeded.len();
            report.failed += round_report.failed.len();
            held.extend(round_report.failed.iter().cloned());
            info!(
                round,
                succeeded = round_report.succeeded.len(),
                failed = round_report.failed.len(),
                elapsed_ms = round_report.elapsed_ms,
                "Round drained"
            );
            report.rounds.push(round_report);
        };

        self.enter(WindowPhase::Closed);
        report.close_reason = reason;
        info!(
            rounds = report.rounds.len(),
            launched = report.launched,
            succeeded = report.succeeded,
            failed = report.failed,
            reason = ?reason,
            "Window closed"
        );
        Ok(report)
    }

    fn tally(
        report: &mut RoundReport,
        joined: Result<Result<TaskResult, ExecutorError>, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(Ok(result)) if result.success => report.succeeded.push(result.service),
            Ok(Ok(result)) => report.failed.push(result.service),
            Ok(Err(e)) => {
                // Rounds are joined before the next selection, so this means
                // something outside the scheduler is driving the same service.
                error!(error = %e, "Task not started");
            }
            Err(e) => error!(error = %e, "Upgrade task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use fleetup_plan::{CatalogSnapshot, Incompatibility};

    use super::*;
    use crate::backend::{ScriptedOutcome, SimulatedBackend};
    use crate::catalog::VersionCatalog;
    use crate::state::StateStore;

    fn plan(services: &[(&str, &[&str], f64)], pairs: Vec<Incompatibility>, parallel: usize) -> FleetPlan {
        let mut lists = BTreeMap::new();
        let mut durations = DurationTable::new();
        for (name, versions, secs) in services {
            lists.insert(
                name.to_string(),
                versions.iter().map(|v| v.to_string()).collect(),
            );
            durations.insert(*name, *secs);
        }
        FleetPlan {
            catalog: CatalogSnapshot::from_lists(lists).unwrap(),
            constraints: ConstraintSet::new(pairs),
            durations,
            parallelism: parallel,
        }
    }

    fn scheduler(plan: FleetPlan, backend: SimulatedBackend, config: SchedulerConfig) -> WindowScheduler {
        let executor = TaskExecutor::new(
            Arc::new(backend),
            Arc::new(VersionCatalog::new(plan.catalog.clone())),
            Arc::new(StateStore::new()),
        );
        WindowScheduler::new(executor, plan, config)
    }

    fn latency() -> SimulatedBackend {
        SimulatedBackend::new(0).with_default_ready_latency(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_runs_rounds_until_complete() {
        let plan = plan(&[("a", &["a0", "a1", "a2", "a3"], 2.0)], vec![], 1);
        let scheduler = scheduler(plan, latency(), SchedulerConfig::default());

        let report = scheduler.run_window("w").await.unwrap();
        assert_eq!(report.close_reason, CloseReason::FleetComplete);
        assert_eq!(report.rounds.len(), 2);
        assert_eq!(report.rounds[0].targets["a"], "a2");
        assert_eq!(report.rounds[1].targets["a"], "a3");
        assert_eq!(report.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_closes_without_legal_batch() {
        let plan = plan(&[("a", &["a0", "a1"], 30.0)], vec![], 1);
        let scheduler = scheduler(plan, latency(), SchedulerConfig::default());

        let report = scheduler.run_window("w").await.unwrap();
        assert_eq!(report.close_reason, CloseReason::NoLegalBatch);
        assert_eq!(report.launched, 0);
        assert_eq!(*scheduler.subscribe().borrow(), WindowPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_expire_window() {
        let plan = plan(&[("a", &["a0", "a1"], 1.0)], vec![], 1);
        let backend = latency().with_outcome("a", ScriptedOutcome::Unhealthy);
        let config = SchedulerConfig {
            window_length: Duration::from_secs(5),
            ..Default::default()
        };
        let scheduler = scheduler(plan, backend, config);

        let report = scheduler.run_window("w").await.unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.close_reason, CloseReason::NoLegalBatch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_apply_error_is_not_retried_in_window() {
        let plan = plan(&[("a", &["a0", "a1"], 0.01)], vec![], 1);
        let backend = SimulatedBackend::new(0).with_outcome("a", ScriptedOutcome::ApplyError);
        let scheduler = scheduler(plan, backend, SchedulerConfig::default());

        let report = scheduler.run_window("w").await.unwrap();
        assert_eq!(report.rounds.len(), 1);
        assert_eq!(report.rounds[0].failed, vec!["a"]);
        assert_eq!(report.close_reason, CloseReason::NoLegalBatch);
        assert_eq!(scheduler.executor.store().tasks().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_service_does_not_block_others() {
        let plan = plan(
            &[("a", &["a0", "a1"], 1.0), ("b", &["b0", "b1", "b2", "b3"], 1.0)],
            vec![],
            2,
        );
        let backend = latency().with_outcome("a", ScriptedOutcome::Unhealthy);
        let scheduler = scheduler(plan, backend, SchedulerConfig::default());

        let report = scheduler.run_window("w").await.unwrap();
        assert_eq!(report.rounds[0].failed, vec!["a"]);
        assert!(report.rounds[1..].iter().all(|round| !round.targets.contains_key("a")));
        assert_eq!(
            scheduler.executor.catalog().current_version("b").await.unwrap(),
            "b3"
        );
        assert_eq!(report.close_reason, CloseReason::NoLegalBatch);
    }

    struct RejectAfter(u32);

    #[async_trait]
    impl AdmissionGate for RejectAfter {
        async fn admit(&self, _window: &str, round: u32) -> bool {
            round <= self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_rejection_closes_window_and_run() {
        let plan = plan(&[("a", &["a0", "a1", "a2", "a3", "a4"], 1.0)], vec![], 1);
        let scheduler =
            scheduler(plan, latency(), SchedulerConfig::default()).with_gate(Arc::new(RejectAfter(1)));

        let reports = scheduler.run().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].close_reason, CloseReason::AdmissionRejected);
        assert_eq!(reports[0].rounds.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_spans_windows() {
        // Each window fits one 3s round.
        let plan = plan(&[("a", &["a0", "a1", "a2", "a3", "a4"], 3.0)], vec![], 1);
        let backend = SimulatedBackend::new(0).with_default_ready_latency(Duration::from_secs(3));
        let config = SchedulerConfig {
            window_length: Duration::from_secs(4),
            ..Default::default()
        };
        let scheduler = scheduler(plan, backend, config);

        let reports = scheduler.run().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.succeeded == 1));
        assert!(scheduler.executor.catalog().is_complete().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_windows_stop_run() {
        let plan = plan(&[("a", &["a0", "a1"], 1.0)], vec![], 1);
        let backend = latency().with_outcome("a", ScriptedOutcome::Unhealthy);
        let config = SchedulerConfig {
            window_length: Duration::from_secs(3),
            max_idle_windows: 2,
            ..Default::default()
        };
        let scheduler = scheduler(plan, backend, config);

        let reports = scheduler.run().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.succeeded == 0));
    }
}
