//! Results of stage and pipeline runs.

use super::tracker::FailureMode;
use crate::runner::{ProcessOutput, StageArgs, StageOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of the status synchronization run after a successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpReport {
    pub stage_id: String,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
}

/// Result of one stage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRunReport {
    pub entity_id: String,
    pub stage_id: String,
    /// Execution state run the stage belonged to.
    pub run_id: Uuid,
    pub outcome: StageOutcome,
    /// Captured process output.
    pub output: ProcessOutput,
    /// Present when the stage succeeded and a follow-up stage is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<FollowUpReport>,
}

impl StageRunReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Stage selection and behaviour of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineRequest {
    pub failure_mode: FailureMode,
    /// Start at this stage, skipping earlier ones.
    pub from: Option<String>,
    /// Run only these stages (still in pipeline order).
    pub only: Option<Vec<String>>,
    /// Arguments handed to every stage.
    pub args: StageArgs,
}

impl PipelineRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    #[must_use]
    pub fn starting_from(mut self, stage_id: impl Into<String>) -> Self {
        self.from = Some(stage_id.into());
        self
    }

    #[must_use]
    pub fn only(mut self, stage_ids: &[&str]) -> Self {
        self.only = Some(stage_ids.iter().map(|s| (*s).to_string()).collect());
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: StageArgs) -> Self {
        self.args = args;
        self
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub entity_id: String,
    pub run_id: Uuid,
    /// Stage ids in the order they finished, per result.
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Stages not run: downstream of a failure or after a stop.
    pub skipped: Vec<String>,
    /// The run ended early on a stop request or a reset.
    pub stopped: bool,
    pub duration_ms: u64,
    /// Reports of the stages that actually ran.
    pub stages: Vec<StageRunReport>,
}

impl PipelineReport {
    /// True if every selected stage completed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.stopped && self.failed.is_empty() && self.skipped.is_empty()
    }
}
