//! Cooperative stop signals.
//!
//! A stop request is a named, durable marker for a scope (a stage id, or
//! [`PIPELINE_SCOPE`] for whole-pipeline runs). Running work polls the marker
//! at its own checkpoints and consumes it at most once. Nothing here kills
//! anything; forced termination is the process runner's grace escalation.

mod file;
mod memory;

pub use file::FileStopSignals;
pub use memory::InMemoryStopSignals;

use crate::errors::CascadeError;
use crate::utils::{is_valid_identifier, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Scope checked between stages of a pipeline run.
pub const PIPELINE_SCOPE: &str = "pipeline";

/// Acknowledgement of a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAck {
    /// The scope the request targets.
    pub scope: String,
    /// When the marker was (first) written.
    pub requested_at: Timestamp,
    /// True if a stop was already pending for the scope.
    pub already_requested: bool,
}

/// Durable, per-scope stop markers.
#[async_trait]
pub trait StopSignals: Send + Sync {
    /// Requests a stop; repeated requests keep the first timestamp.
    async fn request_stop(&self, scope: &str) -> Result<StopAck, CascadeError>;

    /// Returns true if a stop is pending, without consuming it.
    async fn is_stop_requested(&self, scope: &str) -> Result<bool, CascadeError>;

    /// Consumes a pending stop. Returns true for exactly one caller per request.
    async fn consume_stop(&self, scope: &str) -> Result<bool, CascadeError>;

    /// Removes a pending stop. Idempotent.
    async fn clear_stop(&self, scope: &str) -> Result<(), CascadeError>;

    /// Location of the marker a child process can poll, if file-backed.
    fn marker_path(&self, scope: &str) -> Option<PathBuf>;
}

pub(crate) fn check_scope(scope: &str) -> Result<(), CascadeError> {
    if is_valid_identifier(scope) {
        Ok(())
    } else {
        Err(CascadeError::validation(format!("Invalid stop scope '{scope}'")))
    }
}

/// A scope-bound view for in-process item loops.
#[derive(Clone)]
pub struct StopCheckpoint {
    signals: Arc<dyn StopSignals>,
    scope: String,
}

impl StopCheckpoint {
    /// Creates a checkpoint for a scope.
    pub fn new(signals: Arc<dyn StopSignals>, scope: impl Into<String>) -> Result<Self, CascadeError> {
        let scope = scope.into();
        check_scope(&scope)?;
        Ok(Self { signals, scope })
    }

    /// The scope observed by this checkpoint.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Consumes a pending stop; call between items.
    pub async fn should_stop(&self) -> Result<bool, CascadeError> {
        self.signals.consume_stop(&self.scope).await
    }
}

impl std::fmt::Debug for StopCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopCheckpoint")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_item_loop_stops_at_next_checkpoint() {
        let signals: Arc<dyn StopSignals> = Arc::new(InMemoryStopSignals::new());
        let checkpoint = StopCheckpoint::new(Arc::clone(&signals), "avatares").unwrap();
        let mut committed = Vec::new();

        for item in 0..10 {
            if checkpoint.should_stop().await.unwrap() {
                break;
            }
            committed.push(item);
            if item == 3 {
                signals.request_stop("avatares").await.unwrap();
            }
        }

        // the item in progress finished, nothing after it started
        assert_eq!(committed, vec![0, 1, 2, 3]);
        assert!(!signals.is_stop_requested("avatares").await.unwrap());
    }

    #[tokio::test]
    async fn test_checkpoint_rejects_bad_scope() {
        let signals: Arc<dyn StopSignals> = Arc::new(InMemoryStopSignals::new());
        assert!(StopCheckpoint::new(signals, "../x").is_err());
    }
}
