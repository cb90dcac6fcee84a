//! Task executor.
//!
//! Runs one service's upgrade: apply, wait, readiness check bounded by what
//! is left of the window, then either advance the catalog or roll back.
//! Backend failures never escape a task; they become a `failed` outcome.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::backend::{BackendError, Deployment, DeploymentBackend, Readiness};
use crate::catalog::VersionCatalog;
use crate::state::{
    Completion, FailureReason, NewTask, RollbackStatus, StateError, StateStore, TaskId,
};

/// One upgrade to run.
#[derive(Debug, Clone)]
pub struct UpgradeTask {
    pub service: String,
    pub namespace: String,
    pub origin: String,
    pub target: String,

    /// Planned duration; reported, never enforced.
    pub expected: Duration,

    /// Wait between apply and the readiness check.
    pub readiness_delay: Duration,

    /// Record registered ahead of time, if any.
    pub task_id: Option<TaskId>,

    pub window: Option<String>,
    pub round: Option<u32>,
}

impl UpgradeTask {
    pub fn new(
        service: impl Into<String>,
        origin: impl Into<String>,
        target: impl Into<String>,
        expected: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            namespace: "default".to_string(),
            origin: origin.into(),
            target: target.into(),
            expected,
            readiness_delay: Duration::ZERO,
            task_id: None,
            window: None,
            round: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_readiness_delay(mut self, delay: Duration) -> Self {
        self.readiness_delay = delay;
        self
    }

    pub fn with_task_id(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }

    pub fn in_round(mut self, window: impl Into<String>, round: u32) -> Self {
        self.window = Some(window.into());
        self.round = Some(round);
        self
    }

    fn deployment(&self) -> Deployment {
        Deployment::new(&self.service, &self.namespace, &self.origin, &self.target)
    }

    fn registration(&self) -> NewTask {
        NewTask {
            service: self.service.clone(),
            namespace: self.namespace.clone(),
            origin: self.origin.clone(),
            target: self.target.clone(),
            expected: self.expected,
            window: self.window.clone(),
            round: self.round,
        }
    }
}

/// Outcome of one upgrade task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub service: String,
    pub origin: String,
    pub target: String,
    pub success: bool,

    /// Launch to outcome.
    pub duration: Duration,

    /// Time spent in the readiness check, if it ran.
    pub readiness: Option<Duration>,

    pub failure: Option<FailureReason>,
    pub rollback: Option<RollbackStatus>,
}

/// Executor errors. Backend trouble is not an error here; it is a failed task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The service already has a task in flight.
    #[error("service {service} already has running task {running}")]
    Busy { service: String, running: TaskId },

    #[error(transparent)]
    State(StateError),
}

impl From<StateError> for ExecutorError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Busy { service, running } => Self::Busy { service, running },
            other => Self::State(other),
        }
    }
}

/// Invoked once per finished task.
pub type CompletionCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

/// Executes upgrade tasks against a backend.
#[derive(Clone)]
pub struct TaskExecutor {
    backend: Arc<dyn DeploymentBackend>,
    catalog: Arc<VersionCatalog>,
    store: Arc<StateStore>,
    on_complete: Option<CompletionCallback>,
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("backend", &self.backend.name())
            .field("on_complete", &self.on_complete.is_some())
            .finish_non_exhaustive()
    }
}

/// How the readiness phase ended.
enum Verdict {
    Ready,
    Failed(FailureReason, Option<String>),
}

impl TaskExecutor {
    pub fn new(
        backend: Arc<dyn DeploymentBackend>,
        catalog: Arc<VersionCatalog>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            backend,
            catalog,
            store,
            on_complete: None,
        }
    }

    pub fn with_completion_callback(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn catalog(&self) -> &Arc<VersionCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run one upgrade to a terminal state.
    ///
    /// The readiness check gets whatever is left until `deadline`, not the
    /// task's expected duration. Fails only with `Busy` (or a state store
    /// error); every backend outcome yields `Ok`.
    #[instrument(
        skip(self, task, deadline),
        fields(service = %task.service, origin = %task.origin, target = %task.target)
    )]
    pub async fn run_upgrade(
        &self,
        task: UpgradeTask,
        deadline: Instant,
    ) -> Result<TaskResult, ExecutorError> {
        let (id, registered_here) = match task.task_id {
            Some(id) => (id, false),
            None => (self.store.register(task.registration()).await, true),
        };

        if let Err(err) = self.store.mark_running(id).await {
            if registered_here {
                self.store.discard(id).await;
            }
            warn!(task_id = %id, error = %err, "Task rejected");
            return Err(err.into());
        }

        let started = Instant::now();
        let deployment = task.deployment();
        let mut readiness_elapsed = None;

        let (success, failure, error_message, rollback) = match self.stale_origin(&task).await {
            Some(message) => {
                warn!(task_id = %id, reason = %message, "Task no longer matches catalog");
                (false, Some(FailureReason::StaleOrigin), Some(message), None)
            }
            None => match self
                .drive(id, &task, &deployment, deadline, &mut readiness_elapsed)
                .await
            {
                Verdict::Ready => (true, None, None, None),
                Verdict::Failed(reason, message) => {
                    let rollback = self.roll_back(id, &deployment, started).await;
                    (false, Some(reason), message, Some(rollback))
                }
            },
        };

        let duration = started.elapsed();
        self.store
            .finish(
                id,
                Completion {
                    success,
                    duration,
                    readiness: readiness_elapsed,
                    failure,
                    error_message,
                    rollback,
                },
            )
            .await?;

        info!(
            task_id = %id,
            success,
            failure = ?failure,
            elapsed_ms = duration.as_millis() as u64,
            "Upgrade finished"
        );

        let result = TaskResult {
            task_id: id,
            service: task.service,
            origin: task.origin,
            target: task.target,
            success,
            duration,
            readiness: readiness_elapsed,
            failure,
            rollback,
        };

        if let Some(callback) = &self.on_complete {
            callback(&result);
        }
        Ok(result)
    }

    /// Why the task no longer fits the live catalog, if it doesn't.
    ///
    /// A stale task never reaches the backend, so there is nothing to undo.
    async fn stale_origin(&self, task: &UpgradeTask) -> Option<String> {
        let current = match self.catalog.current_version(&task.service).await {
            Ok(current) => current,
            Err(e) => return Some(e.to_string()),
        };
        if current != task.origin {
            return Some(format!(
                "{} is at {current}, task expects {}",
                task.service, task.origin
            ));
        }
        match self.catalog.version_index(&task.service, &task.target).await {
            Ok(0) => Some(format!("{} is already at {}", task.service, task.target)),
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    /// Apply, wait, check readiness, and advance the catalog on success.
    async fn drive(
        &self,
        id: TaskId,
        task: &UpgradeTask,
        deployment: &Deployment,
        deadline: Instant,
        readiness_elapsed: &mut Option<Duration>,
    ) -> Verdict {
        let verdict = match self.backend.apply(deployment).await {
            Err(e) => {
                error!(task_id = %id, error = %e, "Apply failed");
                Verdict::Failed(FailureReason::ApplyFailed, Some(e.to_string()))
            }
            Ok(()) => {
                if !task.readiness_delay.is_zero() {
                    let wake = (Instant::now() + task.readiness_delay).min(deadline);
                    tokio::time::sleep_until(wake).await;
                }

                let budget = deadline.saturating_duration_since(Instant::now());
                if budget.is_zero() {
                    warn!(task_id = %id, "Window expired before readiness check");
                    Verdict::Failed(FailureReason::WindowExpired, None)
                } else {
                    let check_started = Instant::now();
                    let outcome =
                        tokio::time::timeout(budget, self.backend.check_ready(deployment, budget))
                            .await;
                    let elapsed = check_started.elapsed();
                    *readiness_elapsed = Some(elapsed);
                    Self::judge(id, outcome, elapsed, budget)
                }
            }
        };

        match verdict {
            Verdict::Ready => match self.catalog.advance(&task.service, &task.target).await {
                Ok(()) => {
                    self.store
                        .record_history(&task.service, &task.origin, &task.target)
                        .await;
                    Verdict::Ready
                }
                Err(e) => {
                    error!(task_id = %id, error = %e, "Catalog rejected successful upgrade");
                    Verdict::Failed(FailureReason::CatalogRejected, Some(e.to_string()))
                }
            },
            failed => failed,
        }
    }

    fn judge(
        id: TaskId,
        outcome: Result<Result<Readiness, BackendError>, tokio::time::error::Elapsed>,
        elapsed: Duration,
        budget: Duration,
    ) -> Verdict {
        match outcome {
            Ok(Ok(readiness)) if readiness.ready => Verdict::Ready,
            Ok(Ok(_)) if elapsed >= budget => {
                warn!(task_id = %id, budget_ms = budget.as_millis() as u64, "Readiness timed out");
                Verdict::Failed(FailureReason::ReadinessTimeout, None)
            }
            Ok(Ok(_)) => {
                warn!(task_id = %id, "Rollout unhealthy");
                Verdict::Failed(FailureReason::Unhealthy, None)
            }
            Ok(Err(e)) => {
                error!(task_id = %id, error = %e, "Readiness check failed");
                Verdict::Failed(FailureReason::ReadinessError, Some(e.to_string()))
            }
            Err(_) => {
                warn!(task_id = %id, budget_ms = budget.as_millis() as u64, "Readiness timed out");
                Verdict::Failed(FailureReason::ReadinessTimeout, None)
            }
        }
    }

    /// Best effort; the task is failed either way.
    async fn roll_back(&self, id: TaskId, deployment: &Deployment, started: Instant) -> RollbackStatus {
        match self.backend.rollback(deployment).await {
            Ok(()) => {
                info!(task_id = %id, to = %deployment.origin, "Rollback complete");
                RollbackStatus::Succeeded
            }
            Err(e) => {
                error!(
                    task_id = %id,
                    service = %deployment.service,
                    origin = %deployment.origin,
                    target = %deployment.target,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Rollback failed"
                );
                RollbackStatus::Failed
            }
        }
    }
}
