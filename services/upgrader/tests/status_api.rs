//! Status API integration tests.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use fleetup_upgrader::{
    api::{create_router, StatusState},
    state::{Completion, NewTask, StateStore},
};
use serde_json::Value;
use tower::ServiceExt;

fn new_task(service: &str, origin: &str, target: &str) -> NewTask {
    NewTask {
        service: service.to_string(),
        namespace: "default".to_string(),
        origin: origin.to_string(),
        target: target.to_string(),
        expected: Duration::from_secs(5),
        window: Some("window-1".to_string()),
        round: Some(1),
    }
}

async fn get(router: Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn seeded_store() -> Arc<StateStore> {
    let store = Arc::new(StateStore::new());

    let api = store.register(new_task("api", "v1", "v2")).await;
    store.mark_running(api).await.unwrap();
    store
        .finish(
            api,
            Completion {
                success: true,
                duration: Duration::from_secs(3),
                readiness: Some(Duration::from_secs(2)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store.record_history("api", "v1", "v2").await;

    let db = store.register(new_task("db", "d1", "d2")).await;
    store.mark_running(db).await.unwrap();
    store
}

#[tokio::test]
async fn test_healthz_reports_ok() {
    let router = create_router(StatusState::new(Arc::new(StateStore::new())));
    let (status, body) = get(router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_upgrade_status_lists_every_task() {
    let router = create_router(StatusState::new(seeded_store().await));
    let (status, body) = get(router, "/api/upgrade_status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["succeeded"], 1);
    assert_eq!(body["summary"]["running"], 1);

    let tasks = body["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["service"], "api");
    assert_eq!(tasks[0]["status"], "succeeded");
    assert_eq!(tasks[0]["duration_seconds"], 3.0);
    assert_eq!(tasks[0]["expected_duration"], 5.0);
    assert!(tasks[0]["end_time"].is_string());
    assert_eq!(tasks[1]["status"], "running");
    assert!(tasks[1]["end_time"].is_null());
}

#[tokio::test]
async fn test_service_status_returns_latest_or_404() {
    let store = seeded_store().await;

    let router = create_router(StatusState::new(store.clone()));
    let (status, body) = get(router, "/api/upgrade_status/db").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["origin_version"], "d1");
    assert_eq!(body["target_version"], "d2");

    let router = create_router(StatusState::new(store));
    let (status, body) = get(router, "/api/upgrade_status/cache").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_history_lists_successful_changes() {
    let router = create_router(StatusState::new(seeded_store().await));
    let (status, body) = get(router, "/api/history").await;

    assert_eq!(status, StatusCode::OK);
    let history = body["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["service"], "api");
    assert_eq!(history[0]["from"], "v1");
    assert_eq!(history[0]["to"], "v2");
}
