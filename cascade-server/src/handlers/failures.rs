//! Failure record inspection and reset.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    Json,
};
use cascade::retry::FailureRecord;
use serde::{Deserialize, Serialize};

use super::execution::EntityQuery;
use super::Success;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureList {
    pub entity_id: String,
    pub permanent: usize,
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub entity_id: String,
    /// Resets every record of the entity when absent.
    #[serde(default)]
    pub stage_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub removed: usize,
}

/// GET /api/failures?entityId=
pub async fn list(
    State(state): State<AppState>,
    query: Result<Query<EntityQuery>, QueryRejection>,
) -> ApiResult<Json<Success<FailureList>>> {
    let Query(query) = query?;
    let failures = state.orchestrator.failures().list(&query.entity_id).await?;
    let permanent = failures.iter().filter(|r| r.permanent).count();
    Ok(Json(Success::new(FailureList {
        entity_id: query.entity_id,
        permanent,
        failures,
    })))
}

/// POST /api/failures/reset
pub async fn reset(
    State(state): State<AppState>,
    body: Result<Json<ResetRequest>, JsonRejection>,
) -> ApiResult<Json<Success<ResetResponse>>> {
    let Json(request) = body?;
    let removed = match request.stage_id {
        Some(ref stage_id) => usize::from(state.retry.reset_failure(&request.entity_id, stage_id).await?),
        None => state.retry.reset_all(&request.entity_id).await?,
    };
    Ok(Json(Success::new(ResetResponse { removed })))
}
