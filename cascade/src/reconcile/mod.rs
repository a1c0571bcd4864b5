//! Workflow reconciliation between the external registry and the local mirror.
//!
//! Matching is by external id first, then by exact name. Matched rows take
//! the external fields and keep their local annotations. Workflows with no
//! local row are counted and logged but never created, and unchanged rows
//! are not rewritten, so repeated passes are idempotent.

mod mirror;
mod model;
mod reconciler;
mod registry;

pub use mirror::{InMemoryWorkflowMirror, JsonFileWorkflowMirror, WorkflowMirror};
pub use model::{definition_hash, ExternalWorkflow, RemoteWorkflow, SyncError, SyncSummary};
pub use reconciler::{ReconcilerConfig, WorkflowReconciler};
#[cfg(feature = "http-registry")]
pub use registry::HttpWorkflowRegistry;
pub use registry::{StaticWorkflowRegistry, WorkflowRegistry};
