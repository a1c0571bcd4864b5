//! Failure records and the retry coordinator.
//!
//! A failed stage run leaves a [`FailureRecord`]. The [`RetryCoordinator`]
//! re-attempts retriable records sequentially with exponential backoff,
//! deletes a record on success and marks it permanent once its attempts are
//! exhausted or its failure is not transient.

mod coordinator;
mod policy;
mod store;

pub use coordinator::{RetryCoordinator, RetryDetail, RetryStatus, RetrySummary, StageInvoker};
pub use policy::{RetryPolicy, MAX_BACKOFF};
pub use store::{FailureRecord, FailureStore, InMemoryFailureStore, JsonFileFailureStore};
