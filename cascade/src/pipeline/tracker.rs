//! Failure tolerance for pipeline runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// How a pipeline run reacts to a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop the pipeline on the first failure (default).
    #[default]
    FailFast,
    /// Keep going, skipping stages that depend on a failed or skipped stage.
    ContinueOnFailure,
}

/// Tracks stage results within one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineTracker {
    mode: FailureMode,
    completed: Vec<String>,
    failed: Vec<String>,
    skipped: Vec<String>,
    blocked: HashSet<String>,
}

impl PipelineTracker {
    /// Creates a tracker for the given mode.
    #[must_use]
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn record_completion(&mut self, stage: &str) {
        self.completed.push(stage.to_string());
    }

    pub fn record_failure(&mut self, stage: &str) {
        self.failed.push(stage.to_string());
        self.blocked.insert(stage.to_string());
    }

    /// Records a stage that was not run; its dependents are blocked too.
    pub fn record_skip(&mut self, stage: &str) {
        self.skipped.push(stage.to_string());
        self.blocked.insert(stage.to_string());
    }

    /// Returns true if no further stage should start.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        match self.mode {
            FailureMode::FailFast => !self.failed.is_empty(),
            FailureMode::ContinueOnFailure => false,
        }
    }

    /// Returns true if a stage with these dependencies may run.
    #[must_use]
    pub fn can_run(&self, dependencies: &BTreeSet<String>) -> bool {
        match self.mode {
            FailureMode::FailFast => self.failed.is_empty(),
            FailureMode::ContinueOnFailure => !dependencies.iter().any(|d| self.blocked.contains(d)),
        }
    }

    /// Number of stages that finished, ran or not.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }

    #[must_use]
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    #[must_use]
    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    #[must_use]
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }
}
