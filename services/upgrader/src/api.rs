//! Status HTTP API.
//!
//! Read-only view of the state store for dashboards and operators. It never
//! influences scheduling.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::state::{HistoryEntry, StateStore, StatusSummary, TaskRecord};

/// Shared state for handlers.
#[derive(Clone)]
pub struct StatusState {
    store: Arc<StateStore>,
}

impl StatusState {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Every task plus counts by status.
#[derive(Debug, Serialize)]
pub struct UpgradeStatusResponse {
    pub summary: StatusSummary,
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    detail: String,
}

fn not_found(detail: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            code: "not_found",
            detail,
        }),
    )
        .into_response()
}

/// Build the status router.
pub fn create_router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/upgrade_status", get(upgrade_status))
        .route("/api/upgrade_status/{service}", get(service_status))
        .route("/api/history", get(history))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn upgrade_status(State(state): State<StatusState>) -> impl IntoResponse {
    Json(UpgradeStatusResponse {
        summary: state.store.summary().await,
        tasks: state.store.tasks().await,
    })
}

/// Latest task for one service.
async fn service_status(
    State(state): State<StatusState>,
    Path(service): Path<String>,
) -> Response {
    match state.store.latest_for_service(&service).await {
        Some(task) => Json(task).into_response(),
        None => not_found(format!("no task for service {service}")),
    }
}

async fn history(State(state): State<StatusState>) -> impl IntoResponse {
    Json(HistoryResponse {
        history: state.store.history().await,
    })
}

/// Serve the status API until `shutdown` flips to true.
pub async fn serve(
    addr: SocketAddr,
    store: Arc<StateStore>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Status API listening");

    axum::serve(listener, create_router(StatusState::new(store)))
        .with_graceful_shutdown(async move {
            let mut shutdown = shutdown;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Status API shutting down");
        })
        .await
}
