//! Captured process output and its classification.

use super::protocol::{ResultStatus, StageResult};
use crate::errors::FailureKind;
use serde::{Deserialize, Serialize};

/// Bound on diagnostic text carried in failure messages.
pub const DIAGNOSTIC_TAIL_CHARS: usize = 2_000;

/// Byte buffer that keeps the first `cap` bytes and flags the rest as dropped.
#[derive(Debug, Clone, Default)]
pub struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    total: usize,
}

impl CappedBuffer {
    /// Creates an empty buffer with the given cap.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            total: 0,
        }
    }

    /// Appends bytes, dropping whatever exceeds the cap.
    pub fn push(&mut self, bytes: &[u8]) {
        self.total = self.total.saturating_add(bytes.len());
        let room = self.cap.saturating_sub(self.data.len());
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// True once anything was dropped.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.total > self.data.len()
    }

    /// Total bytes seen, kept or not.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Lossy UTF-8 view of the kept bytes.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Raw result of one child process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    /// Exit code; `None` when killed by a signal or by the runner.
    pub exit_code: Option<i32>,
    /// Captured stdout, at most the stage's output cap.
    pub stdout: String,
    /// Captured stderr, at most the stage's output cap.
    pub stderr: String,
    /// Stdout exceeded the cap.
    pub stdout_truncated: bool,
    /// Stderr exceeded the cap.
    pub stderr_truncated: bool,
    /// Wall-clock run time.
    pub duration_ms: u64,
    /// Killed because the stage timeout elapsed.
    pub timed_out: bool,
    /// Killed because a stop was not honoured within the grace period.
    pub killed_after_stop: bool,
    /// Last structured result line, if any.
    pub result: Option<StageResult>,
}

impl ProcessOutput {
    /// True if either stream was truncated.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    /// Keeps only the last `max_chars` of each stream and flags what was cut.
    #[must_use]
    pub fn tail_only(mut self, max_chars: usize) -> Self {
        self.stdout_truncated |= keep_tail(&mut self.stdout, max_chars);
        self.stderr_truncated |= keep_tail(&mut self.stderr, max_chars);
        self
    }

    /// Classifies the run. A structured result overrides the exit code.
    #[must_use]
    pub fn outcome(&self) -> StageOutcome {
        if self.timed_out {
            return StageOutcome::failed(FailureKind::Timeout, "Stage exceeded its timeout");
        }
        if self.killed_after_stop {
            return StageOutcome::Stopped;
        }

        if let Some(ref result) = self.result {
            return match result.status {
                ResultStatus::Ok => StageOutcome::Succeeded,
                ResultStatus::Stopped => StageOutcome::Stopped,
                ResultStatus::Failed => StageOutcome::failed(
                    result.kind.unwrap_or_default(),
                    result
                        .message
                        .clone()
                        .unwrap_or_else(|| "Stage reported failure".to_string()),
                ),
            };
        }

        match self.exit_code {
            Some(0) => StageOutcome::Succeeded,
            code => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let detail = tail(&self.stderr, DIAGNOSTIC_TAIL_CHARS);
                let message = if detail.trim().is_empty() {
                    format!("Process exited with {code}")
                } else {
                    format!("Process exited with {code}: {}", detail.trim())
                };
                StageOutcome::failed(FailureKind::ChildProcessFailure, message)
            }
        }
    }
}

/// How a stage run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed { kind: FailureKind, message: String },
    Stopped,
}

impl StageOutcome {
    /// Creates a failed outcome.
    #[must_use]
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// The failure kind, with `Stopped` mapped to [`FailureKind::Stopped`].
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Succeeded => None,
            Self::Failed { kind, .. } => Some(*kind),
            Self::Stopped => Some(FailureKind::Stopped),
        }
    }

    /// Human-readable error text for failure records and state.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Succeeded => None,
            Self::Failed { kind, message } => Some(format!("{kind}: {message}")),
            Self::Stopped => Some("stopped: stop requested".to_string()),
        }
    }
}

fn keep_tail(text: &mut String, max_chars: usize) -> bool {
    let kept = tail(text, max_chars);
    if kept.len() == text.len() {
        return false;
    }
    *text = kept.to_string();
    true
}

/// Last `max_chars` characters of `text`.
#[must_use]
pub fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    text.char_indices()
        .nth(skip)
        .map_or(text, |(idx, _)| &text[idx..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_buffer_keeps_prefix() {
        let mut buf = CappedBuffer::new(5);
        buf.push(b"abc");
        buf.push(b"defgh");
        assert_eq!(buf.to_string_lossy(), "abcde");
        assert!(buf.truncated());
        assert_eq!(buf.total_bytes(), 8);

        let mut exact = CappedBuffer::new(3);
        exact.push(b"abc");
        assert!(!exact.truncated());
    }

    #[test]
    fn test_exit_code_classification() {
        let ok = ProcessOutput {
            exit_code: Some(0),
            ..ProcessOutput::default()
        };
        assert_eq!(ok.outcome(), StageOutcome::Succeeded);

        let failed = ProcessOutput {
            exit_code: Some(2),
            stderr: "boom\n".into(),
            ..ProcessOutput::default()
        };
        assert_eq!(
            failed.outcome(),
            StageOutcome::failed(FailureKind::ChildProcessFailure, "Process exited with 2: boom")
        );
    }

    #[test]
    fn test_result_overrides_exit_code() {
        let output = ProcessOutput {
            exit_code: Some(0),
            result: Some(StageResult {
                status: ResultStatus::Failed,
                kind: Some(FailureKind::DependencyUnavailable),
                message: Some("no API key".into()),
                ..StageResult::ok()
            }),
            ..ProcessOutput::default()
        };
        assert_eq!(
            output.outcome().failure_kind(),
            Some(FailureKind::DependencyUnavailable)
        );
    }

    #[test]
    fn test_timeout_wins() {
        let output = ProcessOutput {
            timed_out: true,
            result: Some(StageResult::ok()),
            ..ProcessOutput::default()
        };
        assert_eq!(output.outcome().failure_kind(), Some(FailureKind::Timeout));
    }

    #[test]
    fn test_tail_only_bounds_streams() {
        let output = ProcessOutput {
            exit_code: Some(0),
            stdout: "x".repeat(10_000),
            stderr: "warn\n".into(),
            ..ProcessOutput::default()
        }
        .tail_only(100);

        assert_eq!(output.stdout.len(), 100);
        assert!(output.stdout_truncated);
        assert_eq!(output.stderr, "warn\n");
        assert!(!output.stderr_truncated);
    }

    #[test]
    fn test_tail_is_char_safe() {
        assert_eq!(tail("abc", 5), "abc");
        assert_eq!(tail("açãoé", 2), "oé");
    }
}
