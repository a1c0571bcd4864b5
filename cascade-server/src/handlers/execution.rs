//! Execution state polling and external mutation.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    Json,
};
use cascade::state::{ExecutionState, StateUpdate};
use serde::Deserialize;

use super::Success;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityQuery {
    pub entity_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateAction {
    Update,
    Reset,
}

/// Body of `POST /api/execution-status`; update fields sit next to `action`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateActionRequest {
    pub action: StateAction,
    pub entity_id: String,
    #[serde(flatten)]
    pub update: StateUpdate,
}

/// GET /api/execution-status?entityId=
pub async fn get_status(
    State(state): State<AppState>,
    query: Result<Query<EntityQuery>, QueryRejection>,
) -> ApiResult<Json<Success<ExecutionState>>> {
    let Query(query) = query?;
    Ok(Json(Success::new(state.orchestrator.state().get(&query.entity_id))))
}

/// POST /api/execution-status
pub async fn post_action(
    State(state): State<AppState>,
    body: Result<Json<StateActionRequest>, JsonRejection>,
) -> ApiResult<Json<Success<ExecutionState>>> {
    let Json(request) = body?;
    let snapshot = match request.action {
        StateAction::Update => state
            .orchestrator
            .state()
            .apply(&request.entity_id, request.update)?,
        StateAction::Reset => state.orchestrator.reset(&request.entity_id).await?,
    };
    Ok(Json(Success::new(snapshot)))
}
