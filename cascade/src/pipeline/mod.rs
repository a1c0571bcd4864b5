//! Stage and pipeline orchestration.
//!
//! The [`Orchestrator`] runs one stage, or the ordered pipeline, for an entity.
//! At most one run is active per entity; every transition is published to the
//! [`ExecutionStateStore`](crate::state::ExecutionStateStore), failures are
//! recorded for the retry coordinator, and a successful stage is followed by
//! the registry's status synchronization stage.

mod orchestrator;
mod report;
mod tracker;

pub use orchestrator::Orchestrator;
pub use report::{FollowUpReport, PipelineReport, PipelineRequest, StageRunReport};
pub use tracker::{FailureMode, PipelineTracker};
