//! Direct path: the manager (or an operator) POSTs a task, the worker scans
//! it, PATCHes the response to the manager and only then answers with the
//! same response.

use crate::{client::ManagerClient, service::WorkerService};
use axum::{Json, Router, body::Bytes, extract::State, routing::post};
use crackhash_core::{
    Result,
    types::{Task, WireMessage, WorkerResponse},
};
use tower_http::trace::TraceLayer;

pub const TASK_PATH: &str = "/internal/api/worker/hash/crack/task";

#[derive(Clone)]
struct AppState {
    service: WorkerService,
    client: ManagerClient,
}

pub fn router(service: WorkerService, client: ManagerClient) -> Router {
    Router::new()
        .route(TASK_PATH, post(task))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service, client })
}

async fn task(State(state): State<AppState>, body: Bytes) -> Result<Json<WorkerResponse>> {
    let task = Task::decode(&body)?;
    let response = state.service.process_task(task).await?;
    state.client.report(&response).await?;
    Ok(Json(response))
}
