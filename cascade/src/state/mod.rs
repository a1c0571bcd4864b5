//! Execution state: the live record of what is running per entity.
//!
//! The store is the single writer path for logs and progress during a run.
//! Runs hold a [`RunTicket`]; a reset or a newer run bumps the slot
//! generation so late writes from an orphaned run are discarded.

mod model;
mod store;

pub use model::{ApplyOutcome, ExecutionState, RunTicket, StateUpdate};
pub use store::{ExecutionStateStore, StateStoreConfig, DEFAULT_MAX_LOG_ENTRIES};
