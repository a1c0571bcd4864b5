//! Cooperative stop endpoints.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    Json,
};
use cascade::cancellation::StopAck;
use serde::{Deserialize, Serialize};

use super::Success;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ScopeRequest {
    pub scope: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopStatus {
    pub scope: String,
    pub stop_requested: bool,
}

/// POST /api/stop
pub async fn request_stop(
    State(state): State<AppState>,
    body: Result<Json<ScopeRequest>, JsonRejection>,
) -> ApiResult<Json<Success<StopAck>>> {
    let Json(request) = body?;
    let ack = state.orchestrator.request_stop(&request.scope).await?;
    Ok(Json(Success::new(ack)))
}

/// POST /api/stop/clear
pub async fn clear_stop(
    State(state): State<AppState>,
    body: Result<Json<ScopeRequest>, JsonRejection>,
) -> ApiResult<Json<Success<StopStatus>>> {
    let Json(request) = body?;
    state.orchestrator.signals().clear_stop(&request.scope).await?;
    Ok(Json(Success::new(StopStatus {
        scope: request.scope,
        stop_requested: false,
    })))
}

/// GET /api/stop?scope=
pub async fn get_stop(
    State(state): State<AppState>,
    query: Result<Query<ScopeRequest>, QueryRejection>,
) -> ApiResult<Json<Success<StopStatus>>> {
    let Query(query) = query?;
    let stop_requested = state
        .orchestrator
        .signals()
        .is_stop_requested(&query.scope)
        .await?;
    Ok(Json(Success::new(StopStatus {
        scope: query.scope,
        stop_requested,
    })))
}
