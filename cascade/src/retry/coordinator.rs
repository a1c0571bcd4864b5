//! Re-attempts failed stages with bounded exponential backoff.

use super::policy::RetryPolicy;
use super::store::{FailureRecord, FailureStore};
use crate::errors::CascadeError;
use crate::events::{self, EventSink, NoOpEventSink};
use crate::registry::{StageRegistry, StageScope};
use crate::runner::StageOutcome;
use crate::utils::elapsed_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Runs one stage for an entity on behalf of the coordinator.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    /// Executes the stage and returns how it ended.
    ///
    /// Stage-level failures are outcomes; `Err` is reserved for
    /// infrastructure problems and aborts the retry pass.
    async fn invoke(&self, entity_id: &str, stage_id: &str) -> Result<StageOutcome, CascadeError>;
}

/// What happened to one record during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Would be retried (report-only mode).
    Pending,
    Succeeded,
    Failed,
    /// Not retriable under the policy.
    Permanent,
    /// Held back because an upstream stage is still failing, or by a stop.
    Skipped,
}

/// Per-record line of a [`RetrySummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDetail {
    pub stage_id: String,
    pub status: RetryStatus,
    /// Attempt count after the pass.
    pub attempt_count: u32,
    /// Backoff applied (or that would be applied) before the attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Latest error of the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the record was skipped or made permanent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate result of a retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySummary {
    /// Records matching the entity and scope.
    pub total_failed: usize,
    /// Records eligible for another attempt.
    pub retriable: usize,
    /// Records excluded for good: non-transient or out of attempts.
    pub permanent: usize,
    /// Records actually re-attempted.
    pub processed: usize,
    pub successes: usize,
    pub failures: usize,
    /// Records left untouched this pass.
    pub skipped: usize,
    pub duration_ms: u64,
    /// One line per record; in report-only mode includes the pending ones.
    pub details: Vec<RetryDetail>,
}

impl RetrySummary {
    /// The headline counts `(totalFailed, retriable, successes, failures, skipped)`.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize, usize, usize) {
        (
            self.total_failed,
            self.retriable,
            self.successes,
            self.failures,
            self.skipped,
        )
    }
}

enum Partition {
    Retriable,
    Permanent,
    Skipped(String),
}

/// Re-attempts failed (entity, stage) pairs.
pub struct RetryCoordinator {
    registry: Arc<StageRegistry>,
    failures: Arc<dyn FailureStore>,
    invoker: Arc<dyn StageInvoker>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("stages", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl RetryCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        failures: Arc<dyn FailureStore>,
        invoker: Arc<dyn StageInvoker>,
    ) -> Self {
        Self {
            registry,
            failures,
            invoker,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Records of the entity matching the scope, in pipeline order.
    async fn records_in_scope(
        &self,
        entity_id: &str,
        scope: &StageScope,
    ) -> Result<(Vec<FailureRecord>, Vec<FailureRecord>), CascadeError> {
        if let StageScope::Stage(ref id) = scope {
            self.registry.get(id)?;
        }

        let all = self.failures.list(entity_id).await?;
        let mut in_scope: Vec<FailureRecord> = all
            .iter()
            .filter(|r| scope.includes(&r.stage_id))
            .cloned()
            .collect();
        in_scope.sort_by_key(|r| {
            self.registry
                .get(&r.stage_id)
                .map_or(usize::MAX, |s| s.ordinal)
        });
        Ok((all, in_scope))
    }

    fn partition(
        &self,
        record: &FailureRecord,
        failing: &BTreeSet<&str>,
        policy: &RetryPolicy,
    ) -> Partition {
        if !self.registry.contains(&record.stage_id) {
            return Partition::Skipped(format!("stage '{}' is not registered", record.stage_id));
        }
        if record.is_exhausted(policy.max_retries) {
            return Partition::Permanent;
        }
        let ancestors = self.registry.ancestors(&record.stage_id);
        if let Some(upstream) = ancestors.iter().find(|a| failing.contains(a.as_str())) {
            return Partition::Skipped(format!("upstream stage '{upstream}' is still failing"));
        }
        Partition::Retriable
    }

    /// Retries the failed stages of an entity.
    ///
    /// With `report_only` the records are classified and nothing is executed
    /// or written. Individual stage failures are counted, not raised.
    pub async fn retry(
        &self,
        entity_id: &str,
        scope: &StageScope,
        policy: &RetryPolicy,
        report_only: bool,
    ) -> Result<RetrySummary, CascadeError> {
        policy.validate()?;
        if entity_id.trim().is_empty() {
            return Err(CascadeError::validation("entityId is required"));
        }
        let start = Instant::now();

        let (all, records) = self.records_in_scope(entity_id, scope).await?;
        let failing: BTreeSet<&str> = all.iter().map(|r| r.stage_id.as_str()).collect();

        let mut summary = RetrySummary {
            total_failed: records.len(),
            ..RetrySummary::default()
        };
        let mut queue = Vec::new();

        for record in records {
            match self.partition(&record, &failing, policy) {
                Partition::Retriable => {
                    summary.retriable += 1;
                    queue.push(record);
                }
                Partition::Permanent => {
                    summary.permanent += 1;
                    summary.details.push(RetryDetail {
                        stage_id: record.stage_id.clone(),
                        status: RetryStatus::Permanent,
                        attempt_count: record.attempt_count,
                        delay_ms: None,
                        error: Some(record.last_error.clone()),
                        reason: None,
                    });
                    if !report_only && !record.permanent {
                        let mut record = record;
                        record.permanent = true;
                        self.failures.upsert(record).await?;
                    }
                }
                Partition::Skipped(reason) => {
                    summary.skipped += 1;
                    summary.details.push(RetryDetail {
                        stage_id: record.stage_id,
                        status: RetryStatus::Skipped,
                        attempt_count: record.attempt_count,
                        delay_ms: None,
                        error: Some(record.last_error),
                        reason: Some(reason),
                    });
                }
            }
        }

        if report_only {
            for record in queue {
                summary.details.push(RetryDetail {
                    stage_id: record.stage_id,
                    status: RetryStatus::Pending,
                    attempt_count: record.attempt_count,
                    delay_ms: Some(duration_ms(policy, record.attempt_count)),
                    error: Some(record.last_error),
                    reason: None,
                });
            }
            summary.duration_ms = elapsed_ms(start);
            return Ok(summary);
        }

        let mut stopped = false;
        for mut record in queue {
            if stopped {
                summary.skipped += 1;
                summary.details.push(RetryDetail {
                    stage_id: record.stage_id,
                    status: RetryStatus::Skipped,
                    attempt_count: record.attempt_count,
                    delay_ms: None,
                    error: Some(record.last_error),
                    reason: Some("retry pass stopped".to_string()),
                });
                continue;
            }

            let delay = policy.delay_for(record.attempt_count);
            let delay_ms = duration_ms(policy, record.attempt_count);
            info!(
                entity_id,
                stage_id = %record.stage_id,
                attempt = record.attempt_count + 1,
                delay_ms,
                "Retrying stage after backoff"
            );
            self.events
                .emit(
                    events::RETRY_ATTEMPT,
                    Some(serde_json::json!({
                        "entity_id": entity_id,
                        "stage_id": record.stage_id,
                        "attempt": record.attempt_count + 1,
                        "delay_ms": delay_ms,
                    })),
                )
                .await;
            tokio::time::sleep(delay).await;

            let outcome = match self.invoker.invoke(entity_id, &record.stage_id).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_client_error() => {
                    warn!(entity_id, stage_id = %record.stage_id, error = %e, "Retry attempt rejected, record left as is");
                    summary.skipped += 1;
                    summary.details.push(RetryDetail {
                        stage_id: record.stage_id,
                        status: RetryStatus::Skipped,
                        attempt_count: record.attempt_count,
                        delay_ms: Some(delay_ms),
                        error: Some(record.last_error),
                        reason: Some(e.to_string()),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };
            summary.processed += 1;

            match outcome {
                StageOutcome::Succeeded => {
                    self.failures.remove(entity_id, &record.stage_id).await?;
                    summary.successes += 1;
                    summary.details.push(RetryDetail {
                        stage_id: record.stage_id,
                        status: RetryStatus::Succeeded,
                        attempt_count: record.attempt_count + 1,
                        delay_ms: Some(delay_ms),
                        error: None,
                        reason: None,
                    });
                }
                StageOutcome::Stopped => {
                    // a stop is not the stage's fault; the attempt is not counted
                    warn!(entity_id, stage_id = %record.stage_id, "Retry stopped, skipping the rest");
                    stopped = true;
                    summary.skipped += 1;
                    summary.details.push(RetryDetail {
                        stage_id: record.stage_id,
                        status: RetryStatus::Skipped,
                        attempt_count: record.attempt_count,
                        delay_ms: Some(delay_ms),
                        error: Some(record.last_error),
                        reason: Some("stop requested".to_string()),
                    });
                }
                StageOutcome::Failed { kind, message } => {
                    record.record_attempt(kind, format!("{kind}: {message}"), policy.max_retries);
                    warn!(
                        entity_id,
                        stage_id = %record.stage_id,
                        attempts = record.attempt_count,
                        permanent = record.permanent,
                        error = %message,
                        "Retry attempt failed"
                    );
                    summary.failures += 1;
                    summary.details.push(RetryDetail {
                        stage_id: record.stage_id.clone(),
                        status: RetryStatus::Failed,
                        attempt_count: record.attempt_count,
                        delay_ms: Some(delay_ms),
                        error: Some(record.last_error.clone()),
                        reason: record.permanent.then(|| "retries exhausted".to_string()),
                    });
                    self.failures.upsert(record).await?;
                }
            }
        }

        summary.duration_ms = elapsed_ms(start);
        info!(
            entity_id,
            total = summary.total_failed,
            successes = summary.successes,
            failures = summary.failures,
            skipped = summary.skipped,
            "Retry pass completed"
        );
        self.events
            .emit(
                events::RETRY_COMPLETED,
                Some(serde_json::json!({
                    "entity_id": entity_id,
                    "scope": scope.to_string(),
                    "successes": summary.successes,
                    "failures": summary.failures,
                })),
            )
            .await;

        Ok(summary)
    }

    /// Lists failure records of an entity that will not be retried.
    pub async fn permanent_failures(
        &self,
        entity_id: &str,
        policy: &RetryPolicy,
    ) -> Result<Vec<FailureRecord>, CascadeError> {
        Ok(self
            .failures
            .list(entity_id)
            .await?
            .into_iter()
            .filter(|r| r.is_exhausted(policy.max_retries))
            .collect())
    }

    /// Forgets the failure of one stage, making it eligible for a plain rerun.
    pub async fn reset_failure(&self, entity_id: &str, stage_id: &str) -> Result<bool, CascadeError> {
        self.failures.remove(entity_id, stage_id).await
    }

    /// Forgets every failure of an entity.
    pub async fn reset_all(&self, entity_id: &str) -> Result<usize, CascadeError> {
        self.failures.clear(entity_id).await
    }
}

fn duration_ms(policy: &RetryPolicy, attempt_count: u32) -> u64 {
    u64::try_from(policy.delay_for(attempt_count).as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use crate::events::CollectingEventSink;
    use crate::registry::{Executable, StageDefinition};
    use crate::retry::InMemoryFailureStore;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::time::Instant as TokioInstant;

    #[derive(Default)]
    struct ScriptedInvoker {
        outcomes: Mutex<VecDeque<StageOutcome>>,
        calls: Mutex<Vec<(String, TokioInstant)>>,
        busy: Vec<String>,
    }

    impl ScriptedInvoker {
        fn with(outcomes: Vec<StageOutcome>) -> Arc<Self> {
            Self::busy_on(outcomes, &[])
        }

        /// Invocations of `busy` stages are rejected as if the entity were running.
        fn busy_on(outcomes: Vec<StageOutcome>, busy: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::default(),
                busy: busy.iter().map(|s| (*s).to_string()).collect(),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(s, _)| s.clone()).collect()
        }
    }

    #[async_trait]
    impl StageInvoker for ScriptedInvoker {
        async fn invoke(&self, entity_id: &str, stage_id: &str) -> Result<StageOutcome, CascadeError> {
            self.calls.lock().push((stage_id.to_string(), TokioInstant::now()));
            if self.busy.iter().any(|s| s == stage_id) {
                return Err(CascadeError::EntityBusy(entity_id.to_string()));
            }
            Ok(self
                .outcomes
                .lock()
                .pop_front()
                .unwrap_or(StageOutcome::Succeeded))
        }
    }

    fn registry() -> Arc<StageRegistry> {
        let stage = |id: &str, deps: &[&str]| {
            StageDefinition::new(id, Executable::new("true")).depends_on(deps)
        };
        Arc::new(
            StageRegistry::builder()
                .stage(stage("personas", &[]))
                .stage(stage("biografias", &["personas"]))
                .stage(stage("avatares", &["biografias"]))
                .stage(stage("auditoria", &["personas"]))
                .build()
                .unwrap(),
        )
    }

    fn failed(message: &str) -> StageOutcome {
        StageOutcome::failed(FailureKind::ChildProcessFailure, message)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_attempt_keeps_partial_summary() {
        let store = Arc::new(InMemoryFailureStore::new());
        for stage in ["biografias", "auditoria"] {
            store
                .upsert(FailureRecord::new("E1", stage, FailureKind::Timeout, "slow"))
                .await
                .unwrap();
        }
        let invoker = ScriptedInvoker::busy_on(vec![StageOutcome::Succeeded], &["biografias"]);
        let coordinator = RetryCoordinator::new(registry(), store.clone(), invoker.clone());

        let summary = coordinator
            .retry("E1", &StageScope::All, &RetryPolicy::new().with_delay_ms(0), false)
            .await
            .unwrap();

        assert_eq!(invoker.calls().len(), 2);
        assert_eq!(summary.retriable, 2);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.skipped, 1);

        let kept = store.get("E1", "biografias").await.unwrap().unwrap();
        assert_eq!(kept.attempt_count, 0);
        assert!(store.get("E1", "auditoria").await.unwrap().is_none());

        let detail = summary
            .details
            .iter()
            .find(|d| d.stage_id == "biografias")
            .unwrap();
        assert_eq!(detail.status, RetryStatus::Skipped);
        assert!(detail.reason.as_deref().unwrap_or("").contains("E1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_stage_retry_succeeds() {
        let store = Arc::new(InMemoryFailureStore::new());
        store
            .upsert(FailureRecord::new("E1", "biografias", FailureKind::Timeout, "slow").with_attempts(1))
            .await
            .unwrap();
        let invoker = ScriptedInvoker::with(vec![StageOutcome::Succeeded]);
        let coordinator = RetryCoordinator::new(registry(), store.clone(), invoker.clone());

        let summary = coordinator
            .retry(
                "E1",
                &StageScope::Stage("biografias".into()),
                &RetryPolicy::new().with_max_retries(3),
                false,
            )
            .await
            .unwrap();

        assert_eq!(summary.counts(), (1, 1, 1, 0, 0));
        assert!(store.get("E1", "biografias").await.unwrap().is_none());
        assert_eq!(invoker.calls(), vec!["biografias"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_then_permanent() {
        let store = Arc::new(InMemoryFailureStore::new());
        store
            .upsert(FailureRecord::new("E1", "avatares", FailureKind::ChildProcessFailure, "exit 1"))
            .await
            .unwrap();
        let invoker = ScriptedInvoker::with(vec![failed("a"), failed("b"), failed("c")]);
        let coordinator = RetryCoordinator::new(registry(), store.clone(), invoker.clone());
        let policy = RetryPolicy::new()
            .with_max_retries(3)
            .with_delay_ms(100)
            .with_backoff(2.0);
        let scope = StageScope::Stage("avatares".into());

        let mut delays = Vec::new();
        for _ in 0..3 {
            let before = TokioInstant::now();
            let summary = coordinator.retry("E1", &scope, &policy, false).await.unwrap();
            assert_eq!(summary.failures, 1);
            let called_at = invoker.calls.lock().last().unwrap().1;
            delays.push(called_at.duration_since(before));
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        let record = store.get("E1", "avatares").await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 3);
        assert!(record.permanent);

        let summary = coordinator.retry("E1", &scope, &policy, false).await.unwrap();
        assert_eq!(summary.counts(), (1, 0, 0, 0, 0));
        assert_eq!(summary.permanent, 1);
        assert_eq!(invoker.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_report_only_is_idempotent() {
        let store = Arc::new(InMemoryFailureStore::new());
        for (stage, kind, attempts) in [
            ("personas", FailureKind::Timeout, 0),
            ("auditoria", FailureKind::DependencyUnavailable, 0),
            ("avatares", FailureKind::Timeout, 1),
        ] {
            store
                .upsert(FailureRecord::new("E1", stage, kind, "x").with_attempts(attempts))
                .await
                .unwrap();
        }
        let before = store.list("E1").await.unwrap();
        let invoker = ScriptedInvoker::with(vec![]);
        let coordinator = RetryCoordinator::new(registry(), store.clone(), invoker.clone());

        let first = coordinator
            .retry("E1", &StageScope::All, &RetryPolicy::new(), true)
            .await
            .unwrap();
        let second = coordinator
            .retry("E1", &StageScope::All, &RetryPolicy::new(), true)
            .await
            .unwrap();

        assert_eq!(first.counts(), second.counts());
        // personas retriable, auditoria permanent, avatares blocked by personas
        assert_eq!(first.counts(), (3, 1, 0, 0, 1));
        assert_eq!(first.permanent, 1);
        assert_eq!(store.list("E1").await.unwrap(), before);
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_scope_runs_in_pipeline_order() {
        let store = Arc::new(InMemoryFailureStore::new());
        for stage in ["auditoria", "biografias"] {
            store
                .upsert(FailureRecord::new("E1", stage, FailureKind::Timeout, "x"))
                .await
                .unwrap();
        }
        let invoker = ScriptedInvoker::with(vec![StageOutcome::Succeeded, failed("boom")]);
        let events = Arc::new(CollectingEventSink::new());
        let coordinator = RetryCoordinator::new(registry(), store.clone(), invoker.clone())
            .with_event_sink(events.clone());

        let summary = coordinator
            .retry("E1", &StageScope::All, &RetryPolicy::new(), false)
            .await
            .unwrap();

        assert_eq!(invoker.calls(), vec!["biografias", "auditoria"]);
        assert_eq!(summary.counts(), (2, 2, 1, 1, 0));
        assert_eq!(events.events_of_type("retry.attempt").len(), 2);
        assert_eq!(events.events_of_type("retry.completed").len(), 1);
        assert_eq!(store.get("E1", "auditoria").await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_skips_remaining_records() {
        let store = Arc::new(InMemoryFailureStore::new());
        for stage in ["biografias", "auditoria"] {
            store
                .upsert(FailureRecord::new("E1", stage, FailureKind::Timeout, "x"))
                .await
                .unwrap();
        }
        let invoker = ScriptedInvoker::with(vec![StageOutcome::Stopped]);
        let coordinator = RetryCoordinator::new(registry(), store.clone(), invoker.clone());

        let summary = coordinator
            .retry("E1", &StageScope::All, &RetryPolicy::new(), false)
            .await
            .unwrap();

        assert_eq!(summary.counts(), (2, 2, 0, 0, 2));
        assert_eq!(invoker.calls().len(), 1);
        assert_eq!(store.get("E1", "biografias").await.unwrap().unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_scope_is_validation_error() {
        let coordinator = RetryCoordinator::new(
            registry(),
            Arc::new(InMemoryFailureStore::new()),
            ScriptedInvoker::with(vec![]),
        );
        let err = coordinator
            .retry("E1", &StageScope::Stage("nope".into()), &RetryPolicy::new(), true)
            .await
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_reset_helpers() {
        let store = Arc::new(InMemoryFailureStore::new());
        store
            .upsert(FailureRecord::new("E1", "personas", FailureKind::DependencyUnavailable, "x"))
            .await
            .unwrap();
        let coordinator =
            RetryCoordinator::new(registry(), store.clone(), ScriptedInvoker::with(vec![]));

        assert_eq!(
            coordinator
                .permanent_failures("E1", &RetryPolicy::new())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(coordinator.reset_failure("E1", "personas").await.unwrap());
        assert_eq!(coordinator.reset_all("E1").await.unwrap(), 0);
    }
}
