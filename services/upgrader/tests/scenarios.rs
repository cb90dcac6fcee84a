//! End-to-end upgrade scenarios against the simulated backend.
//!
//! All tests run on a paused clock, so window deadlines and readiness
//! latencies are exact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetup_plan::{FleetDocument, FleetPlan};
use fleetup_upgrader::{
    backend::{ScriptedOutcome, SimulatedBackend},
    catalog::VersionCatalog,
    state::{FailureReason, RollbackStatus, StateStore, TaskStatus},
    CloseReason, SchedulerConfig, TaskExecutor, WindowScheduler,
};
use serde_json::json;

struct Harness {
    scheduler: WindowScheduler,
    catalog: Arc<VersionCatalog>,
    store: Arc<StateStore>,
    backend: Arc<SimulatedBackend>,
}

fn fleet(document: serde_json::Value) -> FleetPlan {
    serde_json::from_value::<FleetDocument>(document)
        .unwrap()
        .into_plan()
        .unwrap()
}

fn harness(plan: FleetPlan, backend: SimulatedBackend, window: Duration) -> Harness {
    let backend = Arc::new(backend);
    let catalog = Arc::new(VersionCatalog::new(plan.catalog.clone()));
    let store = Arc::new(StateStore::new());
    let executor = TaskExecutor::new(backend.clone(), catalog.clone(), store.clone());
    let config = SchedulerConfig {
        window_length: window,
        ..Default::default()
    };
    Harness {
        scheduler: WindowScheduler::new(executor, plan, config),
        catalog,
        store,
        backend,
    }
}

fn ready_after(secs: u64) -> SimulatedBackend {
    SimulatedBackend::new(0).with_default_ready_latency(Duration::from_secs(secs))
}

#[tokio::test(start_paused = true)]
async fn test_two_unconstrained_services_upgrade_together() {
    let plan = fleet(json!({
        "available_versions": { "a": ["a0", "a1"], "b": ["b0", "b1"] },
        "upgrade_duration": { "a": 3, "b": 4 },
        "parallel": 2
    }));
    let h = harness(plan, ready_after(1), Duration::from_secs(20));

    let report = h.scheduler.run_window("w1").await.unwrap();
    assert_eq!(report.rounds.len(), 1);
    assert_eq!(report.rounds[0].succeeded, vec!["a", "b"]);
    assert_eq!(report.close_reason, CloseReason::FleetComplete);

    assert_eq!(h.catalog.current_version("a").await.unwrap(), "a1");
    assert_eq!(h.catalog.current_version("b").await.unwrap(), "b1");
    assert_eq!(h.store.history().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_target_clashing_with_unchanged_service_is_held_back() {
    let plan = fleet(json!({
        "available_versions": { "a": ["v0", "v1"], "b": ["w0"] },
        "incompatible_pairs": [["a", "v1", "b", "w0"]],
        "upgrade_duration": { "a": 2, "b": 2 },
        "parallel": 2
    }));
    let h = harness(plan, ready_after(1), Duration::from_secs(20));

    let report = h.scheduler.run_window("w1").await.unwrap();
    assert_eq!(report.close_reason, CloseReason::NoLegalBatch);
    assert_eq!(report.launched, 0);
    assert!(h.backend.calls().is_empty());
    assert_eq!(h.catalog.current_version("a").await.unwrap(), "v0");
}

#[tokio::test(start_paused = true)]
async fn test_clashing_pair_moves_together_when_both_can_advance() {
    let plan = fleet(json!({
        "available_versions": { "a": ["v0", "v1"], "b": ["w0", "w1"] },
        "incompatible_pairs": [["a", "v1", "b", "w0"]],
        "upgrade_duration": { "a": 2, "b": 2 },
        "parallel": 2
    }));
    let h = harness(plan, ready_after(1), Duration::from_secs(20));

    let report = h.scheduler.run_window("w1").await.unwrap();
    assert_eq!(report.rounds[0].targets.len(), 2);
    assert_eq!(report.rounds[0].targets["a"], "v1");
    assert_eq!(report.rounds[0].targets["b"], "w1");
}

#[tokio::test(start_paused = true)]
async fn test_window_too_short_for_any_service_launches_nothing() {
    let plan = fleet(json!({
        "available_versions": { "a": ["a0", "a1"], "b": ["b0", "b1"] },
        "upgrade_duration": { "a": 8, "b": 5 },
        "parallel": 2
    }));
    let h = harness(plan, ready_after(1), Duration::from_secs(5));

    let report = h.scheduler.run_window("w1").await.unwrap();
    assert_eq!(report.close_reason, CloseReason::NoLegalBatch);
    assert!(report.rounds.is_empty());
    assert!(h.store.tasks().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_beyond_window_fails_and_rolls_back() {
    let plan = fleet(json!({
        "available_versions": { "a": ["a0", "a1"] },
        "upgrade_duration": { "a": 2 },
        "parallel": 1
    }));
    let backend = SimulatedBackend::new(0).with_ready_latency("a", Duration::from_secs(30));
    let h = harness(plan, backend, Duration::from_secs(5));

    let report = h.scheduler.run_window("w1").await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.close_reason, CloseReason::Expired);
    assert_eq!(h.backend.rollbacks(), vec!["a".to_string()]);
    assert_eq!(h.catalog.current_version("a").await.unwrap(), "a0");

    let task = h.store.latest_for_service("a").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure, Some(FailureReason::ReadinessTimeout));
    assert_eq!(task.rollback, Some(RollbackStatus::Succeeded));
    assert!(task.readiness_seconds.unwrap() >= 5.0);
    assert!(task.start_time.is_some() && task.end_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_targets_never_skip_more_than_two_versions() {
    let plan = fleet(json!({
        "available_versions": { "a": ["a0", "a1", "a2", "a3", "a4"] },
        "upgrade_duration": { "a": 1 },
        "parallel": 1
    }));
    let h = harness(plan, ready_after(1), Duration::from_secs(20));

    let report = h.scheduler.run_window("w1").await.unwrap();
    let targets: Vec<&str> = report
        .rounds
        .iter()
        .map(|round| round.targets["a"].as_str())
        .collect();
    assert_eq!(targets, vec!["a2", "a4"]);
}

#[tokio::test(start_paused = true)]
async fn test_successful_upgrade_drops_older_versions() {
    let plan = fleet(json!({
        "available_versions": { "a": ["a0", "a1", "a2", "a3"] },
        "upgrade_duration": { "a": 1 },
        "parallel": 1
    }));
    let h = harness(plan, ready_after(1), Duration::from_secs(1) + Duration::from_millis(500));

    h.scheduler.run_window("w1").await.unwrap();
    assert_eq!(h.catalog.current_version("a").await.unwrap(), "a2");
    assert!(h.catalog.version_index("a", "a0").await.is_err());
    assert!(h.catalog.version_index("a", "a1").await.is_err());
    assert_eq!(h.catalog.version_index("a", "a3").await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_rollback_is_recorded_without_touching_catalog() {
    let plan = fleet(json!({
        "available_versions": { "a": ["a0", "a1"], "b": ["b0", "b1"] },
        "upgrade_duration": { "a": 1, "b": 1 },
        "parallel": 2
    }));
    let backend = ready_after(1)
        .with_outcome("a", ScriptedOutcome::Unhealthy)
        .failing_rollbacks();
    let h = harness(plan, backend, Duration::from_secs(2));

    let report = h.scheduler.run_window("w1").await.unwrap();
    assert_eq!(report.rounds[0].succeeded, vec!["b"]);
    assert_eq!(report.rounds[0].failed, vec!["a"]);

    assert_eq!(h.catalog.current_version("a").await.unwrap(), "a0");
    assert_eq!(h.catalog.current_version("b").await.unwrap(), "b1");
    let task = h.store.latest_for_service("a").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.rollback, Some(RollbackStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_running_tasks_never_exceed_parallelism() {
    let plan = fleet(json!({
        "available_versions": {
            "a": ["a0", "a1"], "b": ["b0", "b1"], "c": ["c0", "c1"], "d": ["d0", "d1"]
        },
        "upgrade_duration": { "a": 1, "b": 4, "c": 3, "d": 2 },
        "parallel": 2
    }));
    let h = harness(plan, ready_after(2), Duration::from_secs(20));

    let peak = Arc::new(AtomicUsize::new(0));
    let monitor = tokio::spawn({
        let store = h.store.clone();
        let peak = peak.clone();
        async move {
            loop {
                let running = store.running_count().await;
                peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    });

    let report = h.scheduler.run_window("w1").await.unwrap();
    monitor.abort();

    // Longest expected durations go first.
    assert_eq!(report.rounds[0].targets.keys().collect::<Vec<_>>(), vec!["b", "c"]);
    assert_eq!(report.rounds[1].targets.keys().collect::<Vec<_>>(), vec!["a", "d"]);
    assert_eq!(report.close_reason, CloseReason::FleetComplete);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}
