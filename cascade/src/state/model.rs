//! Execution state snapshot and partial updates.

use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What is running now for one entity.
///
/// `is_running == true` implies `completed_at` is unset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// The entity (company) this state belongs to.
    pub entity_id: String,
    /// Id of the current or last run.
    pub run_id: Option<Uuid>,
    /// Whether a run is active.
    pub is_running: bool,
    /// The stage currently executing.
    pub current_stage_id: Option<String>,
    /// Completed units within the run.
    pub progress_current: u64,
    /// Expected units within the run.
    pub progress_total: u64,
    /// Append-only, bounded run log.
    pub logs: Vec<String>,
    /// Last error of the run.
    pub error: Option<String>,
    /// When the run started.
    pub started_at: Option<Timestamp>,
    /// When the run ended.
    pub completed_at: Option<Timestamp>,
}

impl ExecutionState {
    /// Creates an idle state for an entity.
    #[must_use]
    pub fn idle(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ..Self::default()
        }
    }
}

/// A partial update: set fields overwrite, `logs` appends.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateUpdate {
    /// Starting or ending a run also stamps the run timestamps.
    pub is_running: Option<bool>,
    pub current_stage_id: Option<String>,
    /// Never moves backwards within a run.
    pub progress_current: Option<u64>,
    pub progress_total: Option<u64>,
    /// Lines appended to the log.
    pub logs: Vec<String>,
    pub error: Option<String>,
}

impl StateUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one log line.
    #[must_use]
    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    /// Sets progress.
    #[must_use]
    pub fn progress(mut self, current: u64, total: u64) -> Self {
        self.progress_current = Some(current);
        self.progress_total = Some(total);
        self
    }

    #[must_use]
    pub fn stage(mut self, stage_id: impl Into<String>) -> Self {
        self.current_stage_id = Some(stage_id.into());
        self
    }

    #[must_use]
    pub fn running(mut self, is_running: bool) -> Self {
        self.is_running = Some(is_running);
        self
    }

    #[must_use]
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Returns true if the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Result of applying an update on behalf of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update was merged.
    Applied,
    /// The run was superseded by a reset or a newer run; the update was dropped.
    Stale,
}

/// Handle of an active run, used to detect orphaned writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTicket {
    /// The entity the run belongs to.
    pub entity_id: String,
    /// The run id.
    pub run_id: Uuid,
    pub(crate) generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_camel_case() {
        let json = serde_json::to_value(ExecutionState::idle("e1")).unwrap();
        assert_eq!(json["entityId"], "e1");
        assert_eq!(json["isRunning"], false);
        assert!(json["completedAt"].is_null());
    }

    #[test]
    fn test_update_deserializes_partial() {
        let update: StateUpdate =
            serde_json::from_str(r#"{"progressCurrent": 3, "logs": ["a"]}"#).unwrap();
        assert_eq!(update.progress_current, Some(3));
        assert_eq!(update.logs, vec!["a"]);
        assert!(update.is_running.is_none());
        assert!(StateUpdate::new().is_empty());
    }
}
