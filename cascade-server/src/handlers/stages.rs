//! Stage listing and run endpoints.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cascade::pipeline::{PipelineRequest, StageRunReport};
use cascade::registry::StageDefinition;
use cascade::runner::{tail, StageArgs, DIAGNOSTIC_TAIL_CHARS};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Success;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageList {
    pub stages: Vec<StageDefinition>,
    pub follow_up: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStageRequest {
    pub entity_id: String,
    pub stage_id: String,
    #[serde(default)]
    pub args: StageArgs,
    #[serde(default)]
    pub force: bool,
    /// Run to completion and return the report instead of answering 202.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPipelineRequest {
    pub entity_id: String,
    #[serde(flatten)]
    pub request: PipelineRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub entity_id: String,
    pub run_id: Uuid,
}

/// Synchronous stage result with a bounded diagnostic tail on failure.
///
/// The embedded report carries at most [`DIAGNOSTIC_TAIL_CHARS`] of each
/// output stream.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRunResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub report: StageRunReport,
}

impl From<StageRunReport> for StageRunResponse {
    fn from(mut report: StageRunReport) -> Self {
        report.output = report.output.tail_only(DIAGNOSTIC_TAIL_CHARS);
        if report.succeeded() {
            return Self {
                success: true,
                message: None,
                output: None,
                report,
            };
        }
        let output = if report.output.stderr.is_empty() {
            &report.output.stdout
        } else {
            &report.output.stderr
        };
        Self {
            success: false,
            message: report.outcome.error_message(),
            output: Some(tail(output, DIAGNOSTIC_TAIL_CHARS).to_string()),
            report,
        }
    }
}

/// GET /api/stages
pub async fn list(State(state): State<AppState>) -> Json<Success<StageList>> {
    let registry = state.orchestrator.registry();
    Json(Success::new(StageList {
        stages: registry.stages().to_vec(),
        follow_up: registry.follow_up().map(|s| s.id.clone()),
    }))
}

/// POST /api/stages/run
///
/// Answers 202 once the run has started, or 409 if the entity is busy.
pub async fn run(
    State(state): State<AppState>,
    body: Result<Json<RunStageRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body?;
    let mut args = request.args;
    args.force |= request.force;

    if request.wait {
        let report = state
            .orchestrator
            .run_stage(&request.entity_id, &request.stage_id, &args)
            .await?;
        return Ok(Json(StageRunResponse::from(report)).into_response());
    }

    let ticket = state
        .orchestrator
        .start_stage(&request.entity_id, &request.stage_id, args)?;
    Ok(accepted(ticket.entity_id, ticket.run_id))
}

/// POST /api/pipeline/run
pub async fn run_pipeline(
    State(state): State<AppState>,
    body: Result<Json<RunPipelineRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(RunPipelineRequest { entity_id, request }) = body?;
    let ticket = state.orchestrator.start_pipeline(&entity_id, request)?;
    Ok(accepted(ticket.entity_id, ticket.run_id))
}

fn accepted(entity_id: String, run_id: Uuid) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(Success::new(RunAccepted { entity_id, run_id })),
    )
        .into_response()
}
