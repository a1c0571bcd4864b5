//! Retry endpoint.

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use cascade::registry::StageScope;
use cascade::retry::{RetryPolicy, RetrySummary};
use serde::Deserialize;

use super::Success;
use crate::error::ApiResult;
use crate::state::AppState;

/// Body of `POST /api/retry`; policy fields default per [`RetryPolicy`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub entity_id: String,
    pub stage_scope: StageScope,
    #[serde(default)]
    pub report_only: bool,
    #[serde(flatten)]
    pub policy: RetryPolicy,
}

/// POST /api/retry
pub async fn retry(
    State(state): State<AppState>,
    body: Result<Json<RetryRequest>, JsonRejection>,
) -> ApiResult<Json<Success<RetrySummary>>> {
    let Json(request) = body?;
    tracing::info!(
        entity_id = %request.entity_id,
        scope = %request.stage_scope,
        report_only = request.report_only,
        "Retry requested"
    );
    let summary = state
        .retry
        .retry(
            &request.entity_id,
            &request.stage_scope,
            &request.policy,
            request.report_only,
        )
        .await?;
    Ok(Json(Success::new(summary)))
}
