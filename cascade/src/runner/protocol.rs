//! Structured stdout protocol spoken by stage processes.
//!
//! A stage prints ordinary output freely. Lines starting with
//! [`PROTOCOL_PREFIX`] carry a JSON message:
//!
//! ```text
//! @cascade {"event":"progress","current":3,"total":40,"message":"persona 3"}
//! @cascade {"event":"log","message":"skipping cached biography"}
//! @cascade {"event":"result","status":"failed","kind":"dependency_unavailable","message":"no API key"}
//! ```

use crate::errors::FailureKind;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Prefix marking a protocol line.
pub const PROTOCOL_PREFIX: &str = "@cascade ";

/// A message emitted by a running stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageMessage {
    /// A real checkpoint inside the stage.
    Progress {
        current: u64,
        #[serde(default)]
        total: Option<u64>,
        #[serde(default)]
        message: Option<String>,
    },
    /// A line for the execution log.
    Log { message: String },
    /// The stage's final structured result.
    Result(StageResult),
}

/// Final status reported by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Failed,
    Stopped,
}

/// Structured output of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub status: ResultStatus,
    /// Failure classification; defaults to a transient failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Items processed by the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    /// Items that failed inside the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
    /// Free-form stage output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl StageResult {
    /// A successful result with no detail.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: ResultStatus::Ok,
            kind: None,
            message: None,
            processed: None,
            failed: None,
            data: None,
        }
    }
}

/// Parses one stdout line.
///
/// Returns `None` for ordinary output and for malformed protocol lines, which
/// are logged and otherwise treated as plain text.
#[must_use]
pub fn parse_line(line: &str) -> Option<StageMessage> {
    let payload = line.trim_end().strip_prefix(PROTOCOL_PREFIX)?;
    match serde_json::from_str(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed protocol line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_output_is_ignored() {
        assert_eq!(parse_line("Generating biography for Ana"), None);
        assert_eq!(parse_line("@cascade not json"), None);
    }

    #[test]
    fn test_progress_line() {
        let msg = parse_line(r#"@cascade {"event":"progress","current":3,"total":40}"#);
        assert_eq!(
            msg,
            Some(StageMessage::Progress {
                current: 3,
                total: Some(40),
                message: None,
            })
        );
    }

    #[test]
    fn test_result_line() {
        let msg = parse_line(
            "@cascade {\"event\":\"result\",\"status\":\"failed\",\"kind\":\"dependency_unavailable\",\"message\":\"no key\"}\n",
        );
        let Some(StageMessage::Result(result)) = msg else {
            panic!("expected result, got {msg:?}");
        };
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.kind, Some(FailureKind::DependencyUnavailable));
        assert_eq!(result.message.as_deref(), Some("no key"));
    }
}
