//! # Cascade
//!
//! Orchestration and reconciliation core for the virtual company generation
//! pipeline.
//!
//! Cascade runs the generation stages of an entity as isolated child
//! processes and keeps the surrounding bookkeeping consistent:
//!
//! - **Stage registry**: the ordered stage list with per-stage limits
//! - **Process runner**: timeouts, output caps and a line protocol for progress
//! - **Execution state**: one live run per entity, with stale-run protection
//! - **Retry coordination**: failure records, backoff and permanent marking
//! - **Cooperative stop**: durable per-scope markers polled at checkpoints
//! - **Workflow reconciliation**: mirrors an external workflow registry locally
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cascade::prelude::*;
//! use std::{path::Path, sync::Arc};
//!
//! let registry = Arc::new(default_registry(Path::new("scripts"))?);
//! let orchestrator = Orchestrator::new(
//!     registry,
//!     Arc::new(ExecutionStateStore::new()),
//!     Arc::new(FileStopSignals::new("state/stop")),
//!     Arc::new(JsonFileFailureStore::new("state/failures")),
//! );
//!
//! let report = orchestrator
//!     .run_pipeline("acme", &PipelineRequest::new())
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod state;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{
        FileStopSignals, InMemoryStopSignals, StopAck, StopCheckpoint, StopSignals,
        PIPELINE_SCOPE,
    };
    pub use crate::errors::{CascadeError, FailureKind, RegistryError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        FailureMode, Orchestrator, PipelineReport, PipelineRequest, StageRunReport,
    };
    pub use crate::reconcile::{
        ExternalWorkflow, JsonFileWorkflowMirror, SyncSummary, WorkflowMirror,
        WorkflowReconciler, WorkflowRegistry,
    };
    pub use crate::registry::{
        default_registry, StageDefinition, StageLimits, StageRegistry, StageScope,
    };
    pub use crate::retry::{
        FailureRecord, FailureStore, JsonFileFailureStore, RetryCoordinator, RetryPolicy,
        RetrySummary,
    };
    pub use crate::runner::{ProcessRunner, RunnerConfig, StageArgs, StageOutcome};
    pub use crate::state::{ExecutionState, ExecutionStateStore, StateUpdate};
    pub use crate::utils::Timestamp;
}
