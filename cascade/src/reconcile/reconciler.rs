//! Diffs the external workflow list against the local mirror.

use super::mirror::WorkflowMirror;
use super::model::{ExternalWorkflow, RemoteWorkflow, SyncError, SyncSummary};
use super::registry::WorkflowRegistry;
use crate::errors::CascadeError;
use crate::events::{self, EventSink, NoOpEventSink};
use crate::utils::{elapsed_ms, now_utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Configuration for periodic reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Interval between periodic passes.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_secs(1));
        self
    }
}

/// Keeps the local workflow mirror in step with the external registry.
pub struct WorkflowReconciler {
    registry: Arc<dyn WorkflowRegistry>,
    mirror: Arc<dyn WorkflowMirror>,
    events: Arc<dyn EventSink>,
    config: ReconcilerConfig,
}

impl std::fmt::Debug for WorkflowReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowReconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Pairs each external workflow with at most one mirror row.
///
/// `external_id` matches win; remaining workflows fall back to an exact name
/// match among rows that are unclaimed and not linked to another workflow
/// still present externally.
fn match_rows<'a>(
    remote: &'a [RemoteWorkflow],
    rows: &'a [ExternalWorkflow],
) -> Vec<(&'a RemoteWorkflow, Option<&'a ExternalWorkflow>)> {
    let by_external: HashMap<&str, &ExternalWorkflow> = rows
        .iter()
        .filter_map(|r| r.external_id.as_deref().map(|id| (id, r)))
        .collect();
    let live_ids: HashSet<&str> = remote.iter().map(|w| w.id.as_str()).collect();

    let mut claimed: HashSet<Uuid> = HashSet::new();
    let mut pairs: Vec<(&RemoteWorkflow, Option<&ExternalWorkflow>)> = remote
        .iter()
        .map(|w| {
            let row = by_external.get(w.id.as_str()).copied();
            if let Some(row) = row {
                claimed.insert(row.local_id);
            }
            (w, row)
        })
        .collect();

    for (workflow, slot) in &mut pairs {
        if slot.is_some() {
            continue;
        }
        *slot = rows.iter().find(|r| {
            !claimed.contains(&r.local_id)
                && r.name == workflow.name
                && r.external_id
                    .as_deref()
                    .map_or(true, |id| !live_ids.contains(id))
        });
        if let Some(row) = slot {
            claimed.insert(row.local_id);
        }
    }

    pairs
}

impl WorkflowReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(registry: Arc<dyn WorkflowRegistry>, mirror: Arc<dyn WorkflowMirror>) -> Self {
        Self {
            registry,
            mirror,
            events: Arc::new(NoOpEventSink),
            config: ReconcilerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs one reconciliation pass.
    ///
    /// Failing to list either side is an error. Failing to write a row is
    /// recorded in `errors` and the pass continues.
    pub async fn sync(&self, entity_id: Option<&str>) -> Result<SyncSummary, CascadeError> {
        let start = Instant::now();
        let remote = self.registry.list_workflows().await?;
        let rows = self.mirror.list(entity_id).await?;

        let mut summary = SyncSummary {
            total: remote.len(),
            ..SyncSummary::default()
        };
        let mut unmatched = Vec::new();
        let mut writes = FuturesUnordered::new();
        let now = now_utc();

        for (workflow, row) in match_rows(&remote, &rows) {
            let Some(row) = row else {
                unmatched.push(workflow.name.as_str());
                continue;
            };
            let Some(merged) = row.merged_with(workflow, now) else {
                continue;
            };
            let mirror = &self.mirror;
            writes.push(async move { (workflow, mirror.upsert(merged).await) });
        }

        // rows are independent; one failed write never blocks the others
        while let Some((workflow, result)) = writes.next().await {
            match result {
                Ok(()) => summary.updated += 1,
                Err(e) => {
                    warn!(
                        workflow = %workflow.name,
                        external_id = %workflow.id,
                        error = %e,
                        "Failed to update mirrored workflow"
                    );
                    summary.errors.push(SyncError {
                        workflow: workflow.name.clone(),
                        external_id: workflow.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        summary.errors.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        summary.unmatched = unmatched.len();
        if !unmatched.is_empty() {
            info!(
                count = unmatched.len(),
                workflows = ?unmatched,
                "External workflows without a local row were not imported"
            );
        }

        summary.duration_ms = elapsed_ms(start);
        info!(
            entity_id = entity_id.unwrap_or("*"),
            total = summary.total,
            updated = summary.updated,
            errors = summary.errors.len(),
            "Workflow sync completed"
        );
        self.events
            .emit(
                events::WORKFLOW_SYNC_COMPLETED,
                Some(serde_json::json!({
                    "entity_id": entity_id,
                    "total": summary.total,
                    "updated": summary.updated,
                    "unmatched": summary.unmatched,
                    "errors": summary.errors.len(),
                })),
            )
            .await;

        Ok(summary)
    }

    /// Runs [`sync`](Self::sync) for all entities on the configured interval.
    ///
    /// The first pass runs immediately. Failed passes are logged; the task
    /// runs until aborted.
    #[must_use]
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sync(None).await {
                    error!(error = %e, "Periodic workflow sync failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::reconcile::registry::MockWorkflowRegistry;
    use crate::reconcile::{InMemoryWorkflowMirror, StaticWorkflowRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn remote(id: &str, name: &str) -> RemoteWorkflow {
        RemoteWorkflow::new(id, name)
            .active(true)
            .with_field("nodes", json!([{"type": "n8n-nodes-base.webhook"}]))
    }

    /// Mirror that refuses writes for one local id.
    struct FlakyMirror {
        inner: InMemoryWorkflowMirror,
        poisoned: Uuid,
    }

    #[async_trait::async_trait]
    impl WorkflowMirror for FlakyMirror {
        async fn list(&self, entity_id: Option<&str>) -> Result<Vec<ExternalWorkflow>, CascadeError> {
            self.inner.list(entity_id).await
        }

        async fn upsert(&self, row: ExternalWorkflow) -> Result<(), CascadeError> {
            if row.local_id == self.poisoned {
                return Err(CascadeError::storage("constraint violation"));
            }
            self.inner.upsert(row).await
        }
    }

    #[tokio::test]
    async fn test_second_sync_is_idempotent() {
        let mirror = Arc::new(InMemoryWorkflowMirror::new(vec![
            ExternalWorkflow::new("E1", "Onboarding").linked_to("wf-1"),
            ExternalWorkflow::new("E1", "Payroll"),
        ]));
        let registry = Arc::new(StaticWorkflowRegistry::new(vec![
            remote("wf-1", "Onboarding"),
            remote("wf-2", "Payroll"),
            remote("wf-3", "Unknown"),
        ]));
        let events = Arc::new(CollectingEventSink::new());
        let reconciler =
            WorkflowReconciler::new(registry, mirror.clone()).with_event_sink(events.clone());

        let first = reconciler.sync(Some("E1")).await.unwrap();
        assert_eq!((first.total, first.updated, first.created), (3, 2, 0));
        assert_eq!(first.unmatched, 1);

        let second = reconciler.sync(Some("E1")).await.unwrap();
        assert_eq!((second.updated, second.created), (0, 0));
        assert!(second.errors.is_empty());
        assert_eq!(events.events_of_type("workflow_sync.").len(), 2);
        assert_eq!(mirror.len(), 2);
    }

    #[tokio::test]
    async fn test_name_match_relinks_and_preserves_annotations() {
        let row = ExternalWorkflow::new("E1", "Onboarding")
            .linked_to("wf-old")
            .with_annotation("notes", json!("tuned by ops"));
        let local_id = row.local_id;
        let mirror = Arc::new(InMemoryWorkflowMirror::new(vec![row]));
        let registry = Arc::new(StaticWorkflowRegistry::new(vec![remote("wf-new", "Onboarding")]));

        let summary = WorkflowReconciler::new(registry, mirror.clone())
            .sync(None)
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        let row = mirror.row(local_id).unwrap();
        assert_eq!(row.external_id.as_deref(), Some("wf-new"));
        assert_eq!(row.annotations.get("notes"), Some(&json!("tuned by ops")));
        assert!(row.active);
    }

    #[tokio::test]
    async fn test_external_id_beats_name() {
        // row b is linked to wf-1 while row a merely shares its name
        let a = ExternalWorkflow::new("E1", "Onboarding");
        let b = ExternalWorkflow::new("E1", "Old name").linked_to("wf-1");
        let (a_id, b_id) = (a.local_id, b.local_id);
        let mirror = Arc::new(InMemoryWorkflowMirror::new(vec![a, b]));
        let registry = Arc::new(StaticWorkflowRegistry::new(vec![remote("wf-1", "Onboarding")]));

        WorkflowReconciler::new(registry, mirror.clone())
            .sync(None)
            .await
            .unwrap();

        assert_eq!(mirror.row(b_id).unwrap().name, "Onboarding");
        assert!(mirror.row(a_id).unwrap().external_id.is_none());
    }

    #[tokio::test]
    async fn test_row_failure_is_isolated() {
        let rows: Vec<_> = (0..4)
            .map(|i| ExternalWorkflow::new("E1", format!("wf {i}")).linked_to(format!("id-{i}")))
            .collect();
        let poisoned = rows[2].local_id;
        let mirror = Arc::new(FlakyMirror {
            inner: InMemoryWorkflowMirror::new(rows),
            poisoned,
        });
        let registry = Arc::new(StaticWorkflowRegistry::new(
            (0..4).map(|i| remote(&format!("id-{i}"), &format!("wf {i}"))).collect(),
        ));

        let summary = WorkflowReconciler::new(registry, mirror)
            .sync(Some("E1"))
            .await
            .unwrap();

        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].external_id, "id-2");
        assert_eq!(summary.updated, 3);
    }

    #[tokio::test]
    async fn test_registry_failure_propagates() {
        let mut registry = MockWorkflowRegistry::new();
        registry
            .expect_list_workflows()
            .times(1)
            .returning(|| Err(CascadeError::DependencyUnavailable("registry down".into())));
        let reconciler = WorkflowReconciler::new(
            Arc::new(registry),
            Arc::new(InMemoryWorkflowMirror::default()),
        );

        let err = reconciler.sync(None).await.unwrap_err();
        assert!(matches!(err, CascadeError::DependencyUnavailable(_)));
    }

    #[tokio::test]
    async fn test_entity_filter_limits_rows() {
        let mirror = Arc::new(InMemoryWorkflowMirror::new(vec![
            ExternalWorkflow::new("E1", "a").linked_to("1"),
            ExternalWorkflow::new("E2", "b").linked_to("2"),
        ]));
        let mut registry = MockWorkflowRegistry::new();
        registry
            .expect_list_workflows()
            .returning(|| Ok(vec![remote("1", "a"), remote("2", "b")]));

        let summary = WorkflowReconciler::new(Arc::new(registry), mirror)
            .sync(Some("E2"))
            .await
            .unwrap();

        assert_eq!((summary.total, summary.updated, summary.unmatched), (2, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sync_runs_on_interval() {
        let mirror = Arc::new(InMemoryWorkflowMirror::default());
        let events = Arc::new(CollectingEventSink::new());
        let reconciler = Arc::new(
            WorkflowReconciler::new(Arc::new(StaticWorkflowRegistry::default()), mirror)
                .with_event_sink(events.clone())
                .with_config(ReconcilerConfig::default().with_interval(Duration::from_secs(60))),
        );

        let handle = reconciler.spawn_periodic();
        tokio::time::sleep(Duration::from_secs(150)).await;
        handle.abort();

        // passes at 0s, 60s and 120s
        assert_eq!(events.events_of_type("workflow_sync.").len(), 3);
    }
}
