//! Control and status HTTP surface of a worker
//!
//! - `GET  /api/strategies/:id/status` - status record plus freshness verdict
//! - `POST /api/strategies/:id/start`
//! - `POST /api/strategies/:id/stop`
//! - `GET  /api/workers` - live worker registry

use std::future::Future;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use log::info;
use serde::Serialize;
use serde_json::json;

use crate::coordinator::{StopOutcome, WorkerRegistry, WorkerSnapshot};
use crate::errors::{Error, Result};
use crate::grid::StrategyId;
use crate::store::{StatusReader, StatusView};
use crate::worker::{StartOutcome, WorkerHandle};

/// Shared handler state
#[derive(Clone)]
pub struct ServerState {
    pub worker: WorkerHandle,
    pub status: StatusReader,
    pub registry: WorkerRegistry,
}

/// Body of a stop response
#[derive(Debug, Serialize)]
struct StopResponse {
    strategy_id: StrategyId,
    outcome: StopOutcome,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl From<crate::errors::StoreError> for ApiError {
    fn from(err: crate::errors::StoreError) -> Self {
        ApiError(Error::Store(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Catalog(_) => StatusCode::NOT_FOUND,
            Error::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotAssigned { .. } => StatusCode::CONFLICT,
            Error::Store(_) | Error::RuntimeClosed | Error::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/strategies/:id/status", get(status_handler))
        .route("/api/strategies/:id/start", post(start_handler))
        .route("/api/strategies/:id/stop", post(stop_handler))
        .route("/api/workers", get(workers_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(addr: &str, state: ServerState, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn status_handler(
    State(state): State<ServerState>,
    Path(id): Path<StrategyId>,
) -> std::result::Result<Json<StatusView>, ApiError> {
    Ok(Json(state.status.query(id, Utc::now()).await?))
}

async fn start_handler(
    State(state): State<ServerState>,
    Path(id): Path<StrategyId>,
) -> std::result::Result<Json<StartOutcome>, ApiError> {
    Ok(Json(state.worker.start(id).await?))
}

async fn stop_handler(
    State(state): State<ServerState>,
    Path(id): Path<StrategyId>,
) -> std::result::Result<Json<StopResponse>, ApiError> {
    let outcome = state.worker.stop(id).await?;
    Ok(Json(StopResponse {
        strategy_id: id,
        outcome,
    }))
}

async fn workers_handler(
    State(state): State<ServerState>,
) -> std::result::Result<Json<Vec<WorkerSnapshot>>, ApiError> {
    Ok(Json(state.registry.list_workers().await?))
}
