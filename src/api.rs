use crate::collector::{AcceptOutcome, CollectError, ResultCollector};
use crate::coordinator::CycleCoordinator;
use crate::dispatcher::TaskId;
use crate::oracle::Slot;
use crate::registry::MinerUid;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
struct AppState {
    collector: Arc<ResultCollector>,
    coordinator: Arc<CycleCoordinator>,
}

/// Body a miner POSTs back once its task is done. The `(slot, task_id,
/// miner_uid)` triple must match a recorded assignment.
#[derive(Debug, Deserialize)]
pub struct ResultSubmission {
    pub slot: Slot,
    pub task_id: TaskId,
    pub miner_uid: MinerUid,
    pub payload: serde_json::Value,
}

pub fn router(collector: Arc<ResultCollector>, coordinator: Arc<CycleCoordinator>) -> Router {
    let state = AppState {
        collector,
        coordinator,
    };

    Router::new()
        // Health check
        .route("/health", get(health_handler))
        // Coordinator introspection
        .route("/v1/status", get(status_handler))
        // Inbound miner results
        .route("/v1/results", post(submit_result_handler))
        .with_state(state)
}

/// Serves the inbound result API until the token is cancelled.
pub async fn start_server(
    addr: SocketAddr,
    collector: Arc<ResultCollector>,
    coordinator: Arc<CycleCoordinator>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(collector, coordinator);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Result API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.status().await)
}

async fn submit_result_handler(
    State(state): State<AppState>,
    Json(submission): Json<ResultSubmission>,
) -> impl IntoResponse {
    let outcome = state
        .collector
        .accept(
            submission.slot,
            submission.task_id,
            submission.miner_uid,
            submission.payload,
        )
        .await;

    match outcome {
        Ok(AcceptOutcome::Stored(status)) => (
            StatusCode::OK,
            Json(json!({ "outcome": "stored", "status": status })),
        ),
        Ok(AcceptOutcome::Duplicate) => (StatusCode::OK, Json(json!({ "outcome": "duplicate" }))),
        Ok(AcceptOutcome::LateDropped) => (StatusCode::OK, Json(json!({ "outcome": "late" }))),
        Err(e @ CollectError::UnknownAssignment { .. }) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}
