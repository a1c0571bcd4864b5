//! Process runner: one stage, one isolated child process.
//!
//! The runner enforces the stage's wall-clock timeout and output caps, reads
//! the structured protocol lines a stage prints (see [`protocol`]), and, when
//! stop signals are attached, kills a child that ignores a stop request for
//! longer than the grace period.

mod output;
pub mod protocol;
mod process;

pub use output::{tail, CappedBuffer, ProcessOutput, StageOutcome, DIAGNOSTIC_TAIL_CHARS};
pub use process::{ProcessRunner, ENV_ENTITY_ID, ENV_STAGE_ID, ENV_STOP_FILE};
pub use protocol::{ResultStatus, StageMessage, StageResult, PROTOCOL_PREFIX};

use crate::errors::CascadeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Arguments handed to a stage process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StageArgs {
    /// Regenerate even when output already exists.
    pub force: bool,
    /// Extra `--key=value` arguments.
    pub extra: BTreeMap<String, String>,
}

impl StageArgs {
    /// Sets the force flag.
    #[must_use]
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Adds an extra argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Rejects keys that would not survive the `--key=value` encoding.
    pub fn validate(&self) -> Result<(), CascadeError> {
        for key in self.extra.keys() {
            let bad = key.is_empty()
                || key.starts_with('-')
                || key.chars().any(|c| c == '=' || c.is_whitespace() || c.is_control());
            if bad || key == "entity-id" || key == "force" {
                return Err(CascadeError::validation(format!(
                    "Invalid stage argument name '{key}'"
                )));
            }
        }
        Ok(())
    }

    /// Builds the argument vector for an entity.
    #[must_use]
    pub fn to_argv(&self, entity_id: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.extra.len() + 2);
        argv.push(format!("--entity-id={entity_id}"));
        if self.force {
            argv.push("--force".to_string());
        }
        argv.extend(self.extra.iter().map(|(k, v)| format!("--{k}={v}")));
        argv
    }
}

/// Configuration for the [`ProcessRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// How often the stop marker is peeked while a child runs.
    pub stop_poll_interval: Duration,
    /// How long a child may keep running after a stop was observed.
    pub stop_grace: Duration,
    /// How long to wait for output pipes to close after the child exits.
    pub drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stop_poll_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5 * 60),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl RunnerConfig {
    #[must_use]
    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        // tokio intervals panic on zero
        self.stop_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, drain: Duration) -> Self {
        self.drain_timeout = drain;
        self
    }
}
