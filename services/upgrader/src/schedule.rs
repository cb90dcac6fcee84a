//! Pre-planned schedule execution.
//!
//! Runs the windows of a schedule document instead of asking the selector.
//! Every task is registered as pending before anything starts, so observers
//! see the whole plan. Windows run concurrently; each one waits for its
//! start time and launches its tasks after their offsets, bounded by a
//! shared parallelism cap, then joins them all.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use fleetup_plan::{PlanError, ScheduleDocument, TimeWindow};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::executor::{ExecutorError, TaskExecutor, UpgradeTask};
use crate::state::{NewTask, TaskId};

/// Schedule runner errors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    Plan(#[from] PlanError),

    #[error("parallelism must be at least 1")]
    ZeroParallelism,
}

/// Outcome of one scheduled window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleWindowReport {
    pub window_id: String,

    /// The window had already ended when the run started.
    pub skipped: bool,

    pub launched: usize,
    pub succeeded: usize,
    pub failed: usize,

    /// Tasks refused because their service was busy in another window.
    pub rejected: usize,
}

/// A window resolved against the run's reference time.
struct PlannedWindow {
    window: TimeWindow,
    start: Instant,
    deadline: Instant,
    task_ids: Vec<TaskId>,
}

/// Executes a schedule document.
pub struct ScheduleRunner {
    executor: TaskExecutor,
    document: ScheduleDocument,
    permits: Arc<Semaphore>,
}

impl ScheduleRunner {
    /// `parallelism` caps in-flight tasks across all windows.
    pub fn new(
        executor: TaskExecutor,
        document: ScheduleDocument,
        parallelism: usize,
    ) -> Result<Self, ScheduleError> {
        if parallelism == 0 {
            return Err(ScheduleError::ZeroParallelism);
        }
        Ok(Self {
            executor,
            document,
            permits: Arc::new(Semaphore::new(parallelism)),
        })
    }

    /// Run relative to the local wall clock.
    pub async fn run(&self) -> Result<Vec<ScheduleWindowReport>, ScheduleError> {
        self.run_at(Local::now().naive_local()).await
    }

    /// Run as if the wall clock currently read `now`.
    #[instrument(skip(self), fields(windows = self.document.windows().len()))]
    pub async fn run_at(&self, now: NaiveDateTime) -> Result<Vec<ScheduleWindowReport>, ScheduleError> {
        let today = now.date();
        self.document.validate(today)?;

        let origin = Instant::now();
        let mut planned = Vec::new();
        for window in self.document.windows() {
            let (start, end) = window.bounds(today)?;
            let mut task_ids = Vec::with_capacity(window.tasks.len());
            for task in &window.tasks {
                let id = self
                    .executor
                    .store()
                    .register(NewTask {
                        service: task.name.clone(),
                        namespace: task.region.clone(),
                        origin: task.version.from.clone(),
                        target: task.version.to.clone(),
                        expected: task.expected_duration(),
                        window: Some(window.window_id.clone()),
                        round: None,
                    })
                    .await;
                task_ids.push(id);
            }

            planned.push(PlannedWindow {
                window: window.clone(),
                start: origin + (start - now).to_std().unwrap_or_default(),
                deadline: origin + (end - now).to_std().unwrap_or_default(),
                task_ids,
            });
        }
        info!(
            tasks = planned.iter().map(|w| w.task_ids.len()).sum::<usize>(),
            "Schedule registered"
        );

        let mut windows = JoinSet::new();
        for (index, window) in planned.into_iter().enumerate() {
            let executor = self.executor.clone();
            let permits = self.permits.clone();
            windows.spawn(async move { (index, run_window(executor, permits, window).await) });
        }

        let mut reports = vec![ScheduleWindowReport::default(); self.document.windows().len()];
        while let Some(joined) = windows.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = report,
                Err(e) => error!(error = %e, "Schedule window panicked"),
            }
        }
        Ok(reports)
    }
}

async fn run_window(
    executor: TaskExecutor,
    permits: Arc<Semaphore>,
    planned: PlannedWindow,
) -> ScheduleWindowReport {
    let window_id = planned.window.window_id.clone();
    let mut report = ScheduleWindowReport {
        window_id: window_id.clone(),
        ..Default::default()
    };

    if planned.deadline <= Instant::now() {
        warn!(window_id = %window_id, "Window already over, skipping");
        report.skipped = true;
        return report;
    }

    tokio::time::sleep_until(planned.start).await;
    info!(window_id = %window_id, tasks = planned.window.tasks.len(), "Scheduled window opened");

    let mut tasks = JoinSet::new();
    for (task, id) in planned.window.tasks.iter().zip(planned.task_ids) {
        let offset = match task.offset() {
            Ok(offset) => offset,
            Err(e) => {
                error!(task = %task.name, error = %e, "Invalid offset");
                continue;
            }
        };
        let upgrade = UpgradeTask::new(
            &task.name,
            &task.version.from,
            &task.version.to,
            task.expected_duration(),
        )
        .with_namespace(&task.region)
        .with_readiness_delay(task.readiness_delay().unwrap_or(Duration::ZERO))
        .with_task_id(id);

        let executor = executor.clone();
        let permits = permits.clone();
        let launch_at = planned.start + offset;
        let deadline = planned.deadline;
        tasks.spawn(async move {
            tokio::time::sleep_until(launch_at).await;
            let _permit = permits.acquire_owned().await.ok();
            executor.run_upgrade(upgrade, deadline).await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(result)) => {
                report.launched += 1;
                if result.success {
                    report.succeeded += 1;
                } else {
                    report.failed += 1;
                }
            }
            Ok(Err(ExecutorError::Busy { service, running })) => {
                warn!(window_id = %window_id, service = %service, running = %running, "Service busy, task left pending");
                report.rejected += 1;
            }
            Ok(Err(e)) => {
                error!(window_id = %window_id, error = %e, "Task not started");
                report.rejected += 1;
            }
            Err(e) => error!(window_id = %window_id, error = %e, "Scheduled task panicked"),
        }
    }

    info!(
        window_id = %window_id,
        launched = report.launched,
        succeeded = report.succeeded,
        failed = report.failed,
        rejected = report.rejected,
        "Scheduled window closed"
    );
    report
}
