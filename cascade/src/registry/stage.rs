//! Stage definitions and resource limits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for heavy generation stages (30 minutes).
pub const HEAVY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default timeout for light synchronization stages (30 seconds).
pub const LIGHT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap for each captured output stream (50 MB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// How a stage is launched as a child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Executable {
    /// Program to run.
    pub program: String,
    /// Fixed leading arguments (e.g. the script path).
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, inherited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Executable {
    /// Creates an executable reference.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Appends a fixed argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Resource ceilings enforced by the process runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLimits {
    /// Hard wall-clock timeout.
    #[serde(with = "duration_ms", rename = "timeoutMs")]
    pub timeout: Duration,
    /// Cap for each of stdout and stderr.
    pub max_output_bytes: usize,
}

impl StageLimits {
    /// Limits for long-running generation stages.
    #[must_use]
    pub const fn heavy() -> Self {
        Self {
            timeout: HEAVY_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Limits for fast synchronization stages.
    #[must_use]
    pub const fn light() -> Self {
        Self {
            timeout: LIGHT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl Default for StageLimits {
    fn default() -> Self {
        Self::heavy()
    }
}

/// One stage of the generation pipeline.
///
/// Immutable once the registry is built; `ordinal` is assigned from the
/// registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    /// Stage identifier, also the stop-signal scope of the stage.
    pub id: String,
    /// Position in the pipeline (0-based).
    #[serde(default)]
    pub ordinal: usize,
    /// How to launch the stage.
    pub executable: Executable,
    /// Resource limits.
    #[serde(default)]
    pub limits: StageLimits,
    /// Stages that must have succeeded before this one.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StageDefinition {
    /// Creates a heavy stage definition without dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, executable: Executable) -> Self {
        Self {
            id: id.into(),
            ordinal: 0,
            executable,
            limits: StageLimits::heavy(),
            depends_on: BTreeSet::new(),
            description: None,
        }
    }

    /// Sets the limits.
    #[must_use]
    pub fn with_limits(mut self, limits: StageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = timeout;
        self
    }

    /// Sets the output cap.
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.limits.max_output_bytes = bytes;
        self
    }

    /// Adds dependencies.
    #[must_use]
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on.extend(deps.iter().map(|d| (*d).to_string()));
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_builder() {
        let stage = StageDefinition::new("biografias", Executable::new("node").arg("02.js"))
            .depends_on(&["personas"])
            .with_timeout(Duration::from_secs(60));

        assert_eq!(stage.limits.timeout, Duration::from_secs(60));
        assert_eq!(stage.limits.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert!(stage.depends_on.contains("personas"));
    }

    #[test]
    fn test_limits_serialize_as_millis() {
        let json = serde_json::to_value(StageLimits::light()).unwrap();
        assert_eq!(json["timeoutMs"], 30_000);
        assert_eq!(json["maxOutputBytes"], DEFAULT_MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_stage_deserialize_defaults() {
        let stage: StageDefinition = serde_json::from_value(serde_json::json!({
            "id": "avatares",
            "executable": {"program": "node", "args": ["05a.js"]},
            "dependsOn": ["biografias"]
        }))
        .unwrap();

        assert_eq!(stage.limits, StageLimits::heavy());
        assert_eq!(stage.executable.args, vec!["05a.js"]);
    }
}
