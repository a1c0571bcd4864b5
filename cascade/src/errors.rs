//! Error types for the cascade orchestration core.
//!
//! Two families live here. [`CascadeError`] covers infrastructure and caller
//! errors that propagate to the orchestration API. [`FailureKind`] is the
//! classification of a *stage-level* failure: it is data carried in reports and
//! failure records, never raised.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for cascade operations.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// Bad caller input (4xx-equivalent).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A stage registry could not be built.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The referenced stage is not registered.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// A run is already active for the entity.
    #[error("Entity '{0}' already has an active run")]
    EntityBusy(String),

    /// An external API or required configuration is missing.
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// A child unit of work could not be started.
    #[error("Failed to spawn stage '{stage}': {reason}")]
    Spawn {
        /// The stage id.
        stage: String,
        /// The underlying reason.
        reason: String,
    },

    /// Durable storage could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CascadeError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true if the error was caused by caller input.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::UnknownStage(_) | Self::EntityBusy(_)
        )
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let kind = match self {
            Self::Validation(_) | Self::UnknownStage(_) | Self::Registry(_) => {
                FailureKind::ValidationError
            }
            Self::DependencyUnavailable(_) => FailureKind::DependencyUnavailable,
            _ => FailureKind::PermanentFailure,
        };

        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Errors raised while building a stage registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two stages share an id.
    #[error("Duplicate stage id '{0}'")]
    DuplicateStage(String),

    /// A stage depends on a stage that is not registered before it.
    #[error("Stage '{stage}' depends on unknown or later stage '{dependency}'")]
    UnknownDependency {
        /// The dependent stage.
        stage: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A stage id is not usable as a scope name.
    #[error("Invalid stage id '{0}': use lowercase letters, digits, '_', '-' or '.'")]
    InvalidId(String),

    /// A stage was declared with a zero limit.
    #[error("Stage '{stage}' has an invalid limit: {reason}")]
    InvalidLimit {
        /// The stage id.
        stage: String,
        /// What is wrong.
        reason: String,
    },

    /// The follow-up stage is not registered.
    #[error("Follow-up stage '{0}' is not registered")]
    UnknownFollowUp(String),

    /// The registry has no stages.
    #[error("Stage registry has no stages")]
    Empty,
}

/// Classification of a stage-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stage exceeded its wall-clock timeout.
    Timeout,
    /// The child exited unsuccessfully without a structured result.
    ChildProcessFailure,
    /// The stage rejected its input.
    ValidationError,
    /// An external API or configuration the stage needs is missing.
    DependencyUnavailable,
    /// A failure the stage itself marked as retriable.
    TransientFailure,
    /// A failure that will not succeed on retry.
    PermanentFailure,
    /// The stage honoured a stop request.
    Stopped,
}

impl FailureKind {
    /// Returns true if a retry may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ChildProcessFailure | Self::TransientFailure | Self::Stopped
        )
    }
}

impl Default for FailureKind {
    fn default() -> Self {
        Self::TransientFailure
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ChildProcessFailure => write!(f, "child_process_failure"),
            Self::ValidationError => write!(f, "validation_error"),
            Self::DependencyUnavailable => write!(f, "dependency_unavailable"),
            Self::TransientFailure => write!(f, "transient_failure"),
            Self::PermanentFailure => write!(f, "permanent_failure"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_transient_classification() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::ChildProcessFailure.is_transient());
        assert!(FailureKind::TransientFailure.is_transient());
        assert!(!FailureKind::DependencyUnavailable.is_transient());
        assert!(!FailureKind::ValidationError.is_transient());
        assert!(!FailureKind::PermanentFailure.is_transient());
    }

    #[test]
    fn test_failure_kind_serialize() {
        let json = serde_json::to_string(&FailureKind::DependencyUnavailable).unwrap();
        assert_eq!(json, r#""dependency_unavailable""#);

        let kind: FailureKind = serde_json::from_str(r#""child_process_failure""#).unwrap();
        assert_eq!(kind, FailureKind::ChildProcessFailure);
    }

    #[test]
    fn test_client_errors() {
        assert!(CascadeError::validation("bad").is_client_error());
        assert!(CascadeError::EntityBusy("e1".into()).is_client_error());
        assert!(!CascadeError::storage("disk").is_client_error());
    }

    #[test]
    fn test_registry_error_message() {
        let err = RegistryError::UnknownDependency {
            stage: "biografias".into(),
            dependency: "personas".into(),
        };
        assert!(err.to_string().contains("'personas'"));
    }

    #[test]
    fn test_error_to_dict() {
        let dict = CascadeError::DependencyUnavailable("no api key".into()).to_dict();
        assert_eq!(dict.get("kind").unwrap(), "dependency_unavailable");
    }
}
