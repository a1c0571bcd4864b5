//! Lifecycle event emission.
//!
//! The orchestrator, retry coordinator and reconciler publish events through an
//! [`EventSink`] in addition to their tracing output, so embedders can forward
//! them to their own monitoring.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A stage run started.
pub const STAGE_STARTED: &str = "stage.started";
/// A stage run finished successfully.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage run failed.
pub const STAGE_FAILED: &str = "stage.failed";
/// A stage run honoured a stop request.
pub const STAGE_STOPPED: &str = "stage.stopped";
/// The status synchronization after a successful stage failed.
pub const STAGE_FOLLOW_UP_FAILED: &str = "stage.follow_up_failed";
/// The retry coordinator is about to re-attempt a record.
pub const RETRY_ATTEMPT: &str = "retry.attempt";
/// A retry pass finished.
pub const RETRY_COMPLETED: &str = "retry.completed";
/// A workflow reconciliation pass finished.
pub const WORKFLOW_SYNC_COMPLETED: &str = "workflow_sync.completed";
/// Execution state of an entity was reset.
pub const EXECUTION_RESET: &str = "execution.reset";
/// A stop was requested for a scope.
pub const STOP_REQUESTED: &str = "stop.requested";
