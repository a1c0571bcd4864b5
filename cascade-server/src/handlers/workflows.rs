//! Workflow reconciliation endpoint.

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use cascade::reconcile::SyncSummary;
use serde::Deserialize;

use super::Success;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub entity_id: Option<String>,
}

/// POST /api/workflows/sync
///
/// An empty body syncs every entity.
pub async fn sync(
    State(state): State<AppState>,
    body: Option<Json<SyncRequest>>,
) -> ApiResult<Json<Success<SyncSummary>>> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let reconciler = state.reconciler.as_ref().ok_or_else(|| {
        ApiError::NotConfigured("external workflow registry URL and API key".to_string())
    })?;
    let summary = reconciler.sync(request.entity_id.as_deref()).await?;
    Ok(Json(Success::new(summary)))
}
