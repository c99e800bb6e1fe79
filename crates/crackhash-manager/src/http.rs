//! HTTP front door of the manager.
//!
//! | method | path | body |
//! |---|---|---|
//! | `POST` | `/api/hash/crack` | [`CrackRequest`] → [`CrackResponse`] |
//! | `GET` | `/api/hash/status?requestId=…` | → [`StatusResponse`] |
//! | `PATCH` | `/internal/api/manager/hash/crack/request` | [`WorkerResponse`] |
//!
//! Failures are rendered by [`Error`]'s `IntoResponse` impl.

use crate::service::ManagerService;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, patch, post},
};
use crackhash_core::{
    Error, Result,
    types::{CrackRequest, CrackResponse, RequestId, StatusResponse, WireMessage, WorkerResponse},
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

pub const CRACK_PATH: &str = "/api/hash/crack";
pub const STATUS_PATH: &str = "/api/hash/status";
pub const INGEST_PATH: &str = "/internal/api/manager/hash/crack/request";

pub fn router(service: ManagerService) -> Router {
    Router::new()
        .route(CRACK_PATH, post(crack))
        .route(STATUS_PATH, get(status))
        .route(INGEST_PATH, patch(ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn crack(
    State(service): State<ManagerService>,
    body: core::result::Result<Json<CrackRequest>, JsonRejection>,
) -> Result<Json<CrackResponse>> {
    let Json(request) = body.map_err(|e| Error::InvalidRequest {
        reason: e.body_text(),
    })?;
    let request_id = service
        .create_task(&request.hash, request.max_length)
        .await?;
    Ok(Json(CrackResponse { request_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    request_id: Option<String>,
}

async fn status(
    State(service): State<ManagerService>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>> {
    let id: RequestId = query
        .request_id
        .ok_or_else(|| Error::InvalidRequest {
            reason: "missing `requestId` query parameter".into(),
        })?
        .parse()?;
    Ok(Json(service.status(id).await?))
}

/// Direct-path counterpart of the broker ingestion loop.
async fn ingest(State(service): State<ManagerService>, body: Bytes) -> Result<StatusCode> {
    let response = WorkerResponse::decode(&body)?;
    service.ingest(&response).await?;
    Ok(StatusCode::OK)
}
