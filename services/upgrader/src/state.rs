//! Task state store.
//!
//! Records the lifecycle and timing of every upgrade task so that observers
//! (the status API, reports) can read it at any time, including while tasks
//! are in flight. Each task record has its own lock; the store never has any
//! say in scheduling decisions.
//!
//! Lifecycle: `pending -> running -> {succeeded | failed}`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Identifier of one upgrade attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task_{:06}", self.0)
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend could not apply the target version.
    ApplyFailed,
    /// The window was over before readiness could be checked.
    WindowExpired,
    /// The readiness wait ran out of window time.
    ReadinessTimeout,
    /// The backend reported the rollout unhealthy.
    Unhealthy,
    /// The readiness check itself errored.
    ReadinessError,
    /// The catalog refused to advance to the target.
    CatalogRejected,
    /// The catalog moved past the task's origin before it started.
    StaleOrigin,
}

/// Outcome of the rollback that follows a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Succeeded,
    Failed,
}

/// Everything known about one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub service: String,
    pub namespace: String,
    pub status: TaskStatus,
    pub origin_version: String,
    pub target_version: String,

    /// Planned duration, in seconds.
    pub expected_duration: f64,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Actual duration from launch to outcome, in seconds.
    pub duration_seconds: f64,

    /// Wall-clock time spent in the readiness check, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_seconds: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
}

/// Registration data for a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub service: String,
    pub namespace: String,
    pub origin: String,
    pub target: String,
    pub expected: Duration,
    pub window: Option<String>,
    pub round: Option<u32>,
}

/// Terminal data recorded when a task finishes.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub success: bool,
    pub duration: Duration,
    pub readiness: Option<Duration>,
    pub failure: Option<FailureReason>,
    pub error_message: Option<String>,
    pub rollback: Option<RollbackStatus>,
}

/// One successful version change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub service: String,
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
}

/// Counts of tasks by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// State store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// The service already has a running task.
    #[error("service {service} is busy with {running}")]
    Busy { service: String, running: TaskId },

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Thread-safe task state store.
#[derive(Debug, Default)]
pub struct StateStore {
    next_id: AtomicU64,
    tasks: RwLock<BTreeMap<TaskId, Arc<Mutex<TaskRecord>>>>,
    /// Service -> its running task.
    running: Mutex<HashMap<String, TaskId>>,
    history: RwLock<Vec<HistoryEntry>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, id: TaskId) -> Result<Arc<Mutex<TaskRecord>>, StateError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StateError::UnknownTask(id))
    }

    /// Register a task in `pending` state.
    pub async fn register(&self, task: NewTask) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let record = TaskRecord {
            id,
            service: task.service,
            namespace: task.namespace,
            status: TaskStatus::Pending,
            origin_version: task.origin,
            target_version: task.target,
            expected_duration: task.expected.as_secs_f64(),
            start_time: None,
            end_time: None,
            duration_seconds: 0.0,
            readiness_seconds: None,
            failure: None,
            error_message: None,
            rollback: None,
            window: task.window,
            round: task.round,
        };
        self.tasks
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(record)));
        id
    }

    /// Drop a task that never started.
    pub async fn discard(&self, id: TaskId) {
        let mut tasks = self.tasks.write().await;
        let is_pending = match tasks.get(&id) {
            Some(record) => record.lock().await.status == TaskStatus::Pending,
            None => false,
        };
        if is_pending {
            tasks.remove(&id);
        }
    }

    /// `pending -> running`. Fails with `Busy` if the service already has a
    /// running task.
    pub async fn mark_running(&self, id: TaskId) -> Result<(), StateError> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        if record.status != TaskStatus::Pending {
            return Err(StateError::InvalidTransition {
                id,
                from: record.status,
                to: TaskStatus::Running,
            });
        }

        {
            let mut running = self.running.lock().await;
            if let Some(other) = running.get(&record.service) {
                return Err(StateError::Busy {
                    service: record.service.clone(),
                    running: *other,
                });
            }
            running.insert(record.service.clone(), id);
        }

        record.status = TaskStatus::Running;
        record.start_time = Some(Utc::now());
        info!(task_id = %id, service = %record.service, "Task running");
        Ok(())
    }

    /// `running -> succeeded | failed`.
    pub async fn finish(&self, id: TaskId, completion: Completion) -> Result<TaskRecord, StateError> {
        let record = self.record(id).await?;
        let mut record = record.lock().await;
        let to = if completion.success {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        if record.status != TaskStatus::Running {
            return Err(StateError::InvalidTransition {
                id,
                from: record.status,
                to,
            });
        }

        record.status = to;
        record.end_time = Some(Utc::now());
        record.duration_seconds = completion.duration.as_secs_f64();
        record.readiness_seconds = completion.readiness.map(|d| d.as_secs_f64());
        record.failure = completion.failure;
        record.error_message = completion.error_message;
        record.rollback = completion.rollback;

        self.running.lock().await.remove(&record.service);
        info!(task_id = %id, service = %record.service, status = %to, "Task finished");
        Ok(record.clone())
    }

    pub async fn get(&self, id: TaskId) -> Option<TaskRecord> {
        let record = self.record(id).await.ok()?;
        let record = record.lock().await;
        Some(record.clone())
    }

    /// Every task, in registration order.
    pub async fn tasks(&self) -> Vec<TaskRecord> {
        let records: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(record.lock().await.clone());
        }
        out
    }

    /// Most recently registered task for `service`.
    pub async fn latest_for_service(&self, service: &str) -> Option<TaskRecord> {
        self.tasks()
            .await
            .into_iter()
            .rev()
            .find(|task| task.service == service)
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for task in self.tasks().await {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub async fn record_history(&self, service: &str, from: &str, to: &str) {
        self.history.write().await.push(HistoryEntry {
            service: service.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            at: Utc::now(),
        });
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history.read().await.clone()
    }
}
