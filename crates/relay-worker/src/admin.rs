// Admin HTTP surface: liveness and worker status

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use relay_consumer::{Worker, WorkerStatus};
use serde::Serialize;

#[derive(Clone)]
pub struct AdminState {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub worker: Arc<Worker>,
}

impl AdminState {
    pub fn new(worker_id: impl Into<String>, worker: Arc<Worker>) -> Self {
        Self {
            worker_id: worker_id.into(),
            started_at: Utc::now(),
            worker,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    worker_id: String,
    started_at: DateTime<Utc>,
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        worker_id: state.worker_id,
        started_at: state.started_at,
    })
}

async fn status(State(state): State<AdminState>) -> Json<WorkerStatus> {
    Json(state.worker.status())
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}
