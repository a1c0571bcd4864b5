//! Sequencing of stage and pipeline runs per entity.

use super::report::{FollowUpReport, PipelineReport, PipelineRequest, StageRunReport};
use super::tracker::PipelineTracker;
use crate::cancellation::{StopAck, StopSignals, PIPELINE_SCOPE};
use crate::errors::CascadeError;
use crate::events::{self, EventSink, NoOpEventSink};
use crate::registry::{StageDefinition, StageRegistry};
use crate::retry::{FailureStore, StageInvoker};
use crate::runner::{ProcessRunner, RunnerConfig, StageArgs, StageMessage, StageOutcome};
use crate::state::{ApplyOutcome, ExecutionState, ExecutionStateStore, RunTicket, StateUpdate};
use crate::utils::elapsed_ms;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Who owns the progress counters during a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressOwner {
    /// The stage's own progress lines drive the counters.
    Stage,
    /// The pipeline counts finished stages; stage progress is only logged.
    Pipeline,
}

/// Runs stages and pipelines, publishing every transition to the state store.
pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    runner: ProcessRunner,
    state: Arc<ExecutionStateStore>,
    signals: Arc<dyn StopSignals>,
    failures: Arc<dyn FailureStore>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.registry.len())
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with the default runner configuration.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        state: Arc<ExecutionStateStore>,
        signals: Arc<dyn StopSignals>,
        failures: Arc<dyn FailureStore>,
    ) -> Self {
        let runner = ProcessRunner::new(RunnerConfig::default()).with_stop_signals(Arc::clone(&signals));
        Self {
            registry,
            runner,
            state,
            signals,
            failures,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Replaces the runner configuration.
    #[must_use]
    pub fn with_runner_config(mut self, config: RunnerConfig) -> Self {
        self.runner = ProcessRunner::new(config).with_stop_signals(Arc::clone(&self.signals));
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// The execution state store.
    #[must_use]
    pub fn state(&self) -> &Arc<ExecutionStateStore> {
        &self.state
    }

    /// The stop signal channel.
    #[must_use]
    pub fn signals(&self) -> &Arc<dyn StopSignals> {
        &self.signals
    }

    /// The failure record store.
    #[must_use]
    pub fn failures(&self) -> &Arc<dyn FailureStore> {
        &self.failures
    }

    /// Resets an entity's execution state; a run in flight becomes stale.
    pub async fn reset(&self, entity_id: &str) -> Result<ExecutionState, CascadeError> {
        let state = self.state.reset(entity_id)?;
        self.events
            .emit(
                events::EXECUTION_RESET,
                Some(serde_json::json!({ "entity_id": entity_id })),
            )
            .await;
        Ok(state)
    }

    /// Requests a cooperative stop for a scope.
    pub async fn request_stop(&self, scope: &str) -> Result<StopAck, CascadeError> {
        let ack = self.signals.request_stop(scope).await?;
        self.events
            .emit(
                events::STOP_REQUESTED,
                Some(serde_json::json!({
                    "scope": scope,
                    "already_requested": ack.already_requested,
                })),
            )
            .await;
        Ok(ack)
    }

    fn prepare_stage(
        &self,
        entity_id: &str,
        stage_id: &str,
        args: &StageArgs,
    ) -> Result<(StageDefinition, RunTicket), CascadeError> {
        let stage = self.registry.get(stage_id)?.clone();
        args.validate()?;
        let ticket = self.state.begin_run(entity_id, Some(stage_id), 0)?;
        Ok((stage, ticket))
    }

    /// Runs one stage for an entity and records its failure, if any.
    ///
    /// Rejected with [`CascadeError::EntityBusy`] while another run is active
    /// for the entity.
    pub async fn run_stage(
        &self,
        entity_id: &str,
        stage_id: &str,
        args: &StageArgs,
    ) -> Result<StageRunReport, CascadeError> {
        let (stage, ticket) = self.prepare_stage(entity_id, stage_id, args)?;
        self.run_prepared_stage(&ticket, &stage, args, true).await
    }

    /// Starts a stage run in the background.
    ///
    /// Validation and the busy check happen before returning, so callers get
    /// those errors synchronously.
    pub fn start_stage(
        self: &Arc<Self>,
        entity_id: &str,
        stage_id: &str,
        args: StageArgs,
    ) -> Result<RunTicket, CascadeError> {
        let (stage, ticket) = self.prepare_stage(entity_id, stage_id, &args)?;
        let this = Arc::clone(self);
        let run = ticket.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_prepared_stage(&run, &stage, &args, true).await {
                error!(
                    entity_id = %run.entity_id,
                    stage_id = %stage.id,
                    error = %e,
                    "Background stage run failed"
                );
            }
        });
        Ok(ticket)
    }

    async fn run_prepared_stage(
        &self,
        ticket: &RunTicket,
        stage: &StageDefinition,
        args: &StageArgs,
        record_failures: bool,
    ) -> Result<StageRunReport, CascadeError> {
        let result = self
            .execute_stage(ticket, stage, args, ProgressOwner::Stage)
            .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.state.finish_run(ticket, Some(e.to_string()));
                return Err(e);
            }
        };

        if record_failures {
            if let Err(e) = self.record_outcome(ticket, &stage.id, &report.outcome).await {
                self.state.finish_run(ticket, Some(e.to_string()));
                return Err(e);
            }
        }

        let error = report
            .outcome
            .error_message()
            .map(|message| format!("{}: {message}", stage.id));
        self.state.finish_run(ticket, error);
        Ok(report)
    }

    /// Keeps the failure store in step with a stage outcome.
    ///
    /// A run that was reset meanwhile leaves the store untouched.
    async fn record_outcome(
        &self,
        ticket: &RunTicket,
        stage_id: &str,
        outcome: &StageOutcome,
    ) -> Result<(), CascadeError> {
        let entity_id = ticket.entity_id.as_str();
        if !self.state.is_current(ticket) {
            warn!(entity_id, stage_id, run_id = %ticket.run_id, "Run was reset, not recording its outcome");
            return Ok(());
        }
        match (outcome.failure_kind(), outcome.error_message()) {
            (Some(kind), Some(message)) => {
                self.failures
                    .record_failure(entity_id, stage_id, kind, &message)
                    .await?;
            }
            _ => {
                self.failures.remove(entity_id, stage_id).await?;
            }
        }
        Ok(())
    }

    fn publish(&self, ticket: &RunTicket, update: StateUpdate) -> ApplyOutcome {
        self.state.apply_for_run(ticket, update)
    }

    async fn emit_stage_event(&self, event: &str, ticket: &RunTicket, stage_id: &str, extra: serde_json::Value) {
        let mut data = serde_json::json!({
            "entity_id": ticket.entity_id,
            "stage_id": stage_id,
            "run_id": ticket.run_id.to_string(),
        });
        if let (Some(map), serde_json::Value::Object(extra)) = (data.as_object_mut(), extra) {
            map.extend(extra);
        }
        self.events.emit(event, Some(data)).await;
    }

    async fn execute_stage(
        &self,
        ticket: &RunTicket,
        stage: &StageDefinition,
        args: &StageArgs,
        owner: ProgressOwner,
    ) -> Result<StageRunReport, CascadeError> {
        let entity_id = ticket.entity_id.as_str();
        self.publish(
            ticket,
            StateUpdate::new()
                .stage(&stage.id)
                .log(format!("{}: started", stage.id)),
        );
        info!(entity_id, stage_id = %stage.id, run_id = %ticket.run_id, "Stage started");
        self.emit_stage_event(events::STAGE_STARTED, ticket, &stage.id, serde_json::json!({}))
            .await;

        let state = Arc::clone(&self.state);
        let stage_id = stage.id.clone();
        let observer = move |message: StageMessage| {
            let update = match message {
                StageMessage::Progress { current, total, message } => {
                    let mut update = StateUpdate::new();
                    if owner == ProgressOwner::Stage {
                        update.progress_current = Some(current);
                        update.progress_total = total;
                    }
                    if let Some(message) = message {
                        update.logs.push(format!("{stage_id}: {message}"));
                    }
                    update
                }
                StageMessage::Log { message } => StateUpdate::new().log(format!("{stage_id}: {message}")),
                StageMessage::Result(_) => return,
            };
            if !update.is_empty() {
                state.apply_for_run(ticket, update);
            }
        };

        let output = self.runner.run(stage, entity_id, args, observer).await?;
        let outcome = output.outcome();

        if output.truncated() {
            self.publish(
                ticket,
                StateUpdate::new().log(format!(
                    "{}: warning: output exceeded {} bytes and was truncated",
                    stage.id, stage.limits.max_output_bytes
                )),
            );
        }

        let mut follow_up = None;
        match &outcome {
            StageOutcome::Succeeded => {
                self.publish(
                    ticket,
                    StateUpdate::new().log(format!("{}: completed in {} ms", stage.id, output.duration_ms)),
                );
                info!(entity_id, stage_id = %stage.id, duration_ms = output.duration_ms, "Stage completed");
                self.emit_stage_event(
                    events::STAGE_COMPLETED,
                    ticket,
                    &stage.id,
                    serde_json::json!({ "duration_ms": output.duration_ms }),
                )
                .await;
                follow_up = self.run_follow_up(ticket, stage).await;
            }
            StageOutcome::Failed { kind, message } => {
                self.publish(
                    ticket,
                    StateUpdate::new()
                        .log(format!("{}: failed ({kind}): {message}", stage.id))
                        .error(format!("{}: {message}", stage.id)),
                );
                warn!(entity_id, stage_id = %stage.id, kind = %kind, error = %message, "Stage failed");
                self.emit_stage_event(
                    events::STAGE_FAILED,
                    ticket,
                    &stage.id,
                    serde_json::json!({ "kind": kind, "error": message }),
                )
                .await;
            }
            StageOutcome::Stopped => {
                self.publish(ticket, StateUpdate::new().log(format!("{}: stopped", stage.id)));
                info!(entity_id, stage_id = %stage.id, "Stage stopped on request");
                // the stop has been honoured; a leftover marker must not hit the next run
                if let Err(e) = self.signals.clear_stop(&stage.id).await {
                    warn!(stage_id = %stage.id, error = %e, "Failed to clear stop marker");
                }
                self.emit_stage_event(events::STAGE_STOPPED, ticket, &stage.id, serde_json::json!({}))
                    .await;
            }
        }

        Ok(StageRunReport {
            entity_id: entity_id.to_string(),
            stage_id: stage.id.clone(),
            run_id: ticket.run_id,
            outcome,
            output,
            follow_up,
        })
    }

    /// Runs the status synchronization stage after a success.
    ///
    /// Its failure is reported separately and never changes the parent result.
    async fn run_follow_up(&self, ticket: &RunTicket, parent: &StageDefinition) -> Option<FollowUpReport> {
        let follow_up = self.registry.follow_up()?;
        if follow_up.id == parent.id {
            return None;
        }

        let entity_id = ticket.entity_id.as_str();
        let start = Instant::now();
        let outcome = match self
            .runner
            .run(follow_up, entity_id, &StageArgs::default(), |_| {})
            .await
        {
            Ok(output) => output.outcome(),
            Err(e) => StageOutcome::failed(crate::errors::FailureKind::ChildProcessFailure, e.to_string()),
        };

        if let Some(message) = outcome.error_message() {
            warn!(
                entity_id,
                stage_id = %parent.id,
                follow_up = %follow_up.id,
                error = %message,
                "Status sync after successful stage failed"
            );
            self.publish(
                ticket,
                StateUpdate::new().log(format!(
                    "{}: warning: status sync failed: {message}",
                    parent.id
                )),
            );
            self.emit_stage_event(
                events::STAGE_FOLLOW_UP_FAILED,
                ticket,
                &parent.id,
                serde_json::json!({ "follow_up": follow_up.id, "error": message }),
            )
            .await;
        }

        Some(FollowUpReport {
            stage_id: follow_up.id.clone(),
            outcome,
            duration_ms: elapsed_ms(start),
        })
    }

    fn select_stages(&self, request: &PipelineRequest) -> Result<Vec<StageDefinition>, CascadeError> {
        let first = match request.from {
            Some(ref from) => self.registry.get(from)?.ordinal,
            None => 0,
        };
        if let Some(ref only) = request.only {
            for id in only {
                self.registry.get(id)?;
            }
        }

        let selected: Vec<StageDefinition> = self
            .registry
            .pipeline_stages()
            .filter(|s| s.ordinal >= first)
            .filter(|s| request.only.as_ref().map_or(true, |only| only.contains(&s.id)))
            .cloned()
            .collect();

        if selected.is_empty() {
            return Err(CascadeError::validation("No pipeline stages selected"));
        }
        Ok(selected)
    }

    fn prepare_pipeline(
        &self,
        entity_id: &str,
        request: &PipelineRequest,
    ) -> Result<(Vec<StageDefinition>, RunTicket), CascadeError> {
        request.args.validate()?;
        let stages = self.select_stages(request)?;
        let total = u64::try_from(stages.len()).unwrap_or(u64::MAX);
        let ticket = self.state.begin_run(entity_id, None, total)?;
        Ok((stages, ticket))
    }

    /// Runs the selected pipeline stages in order within one run.
    pub async fn run_pipeline(
        &self,
        entity_id: &str,
        request: &PipelineRequest,
    ) -> Result<PipelineReport, CascadeError> {
        let (stages, ticket) = self.prepare_pipeline(entity_id, request)?;
        self.run_prepared_pipeline(&ticket, &stages, request).await
    }

    /// Starts a pipeline run in the background.
    pub fn start_pipeline(
        self: &Arc<Self>,
        entity_id: &str,
        request: PipelineRequest,
    ) -> Result<RunTicket, CascadeError> {
        let (stages, ticket) = self.prepare_pipeline(entity_id, &request)?;
        let this = Arc::clone(self);
        let run = ticket.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_prepared_pipeline(&run, &stages, &request).await {
                error!(entity_id = %run.entity_id, error = %e, "Background pipeline run failed");
            }
        });
        Ok(ticket)
    }

    async fn run_prepared_pipeline(
        &self,
        ticket: &RunTicket,
        stages: &[StageDefinition],
        request: &PipelineRequest,
    ) -> Result<PipelineReport, CascadeError> {
        let start = Instant::now();
        let entity_id = ticket.entity_id.as_str();
        let total = u64::try_from(stages.len()).unwrap_or(u64::MAX);

        // a marker left over from an earlier run must not cancel this one
        if self.signals.consume_stop(PIPELINE_SCOPE).await.unwrap_or(false) {
            info!(entity_id, "Discarded stale pipeline stop request");
        }

        info!(entity_id, run_id = %ticket.run_id, stages = stages.len(), mode = ?request.failure_mode, "Pipeline started");
        self.publish(
            ticket,
            StateUpdate::new().log(format!("pipeline: {} stages", stages.len())),
        );

        let mut tracker = PipelineTracker::new(request.failure_mode);
        let mut reports = Vec::new();
        let mut stopped = false;
        let mut remaining = stages.iter();

        for stage in remaining.by_ref() {
            match self.signals.consume_stop(PIPELINE_SCOPE).await {
                Ok(true) => {
                    info!(entity_id, before_stage = %stage.id, "Pipeline stop observed");
                    self.publish(ticket, StateUpdate::new().log("pipeline: stopped on request"));
                    tracker.record_skip(&stage.id);
                    stopped = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Cannot check pipeline stop marker"),
            }

            if tracker.should_stop() || !tracker.can_run(&stage.depends_on) {
                self.publish(
                    ticket,
                    StateUpdate::new().log(format!("{}: skipped (upstream failure)", stage.id)),
                );
                tracker.record_skip(&stage.id);
            } else {
                let report = match self
                    .execute_stage(ticket, stage, &request.args, ProgressOwner::Pipeline)
                    .await
                {
                    Ok(report) => report,
                    Err(e) => {
                        self.state.finish_run(ticket, Some(e.to_string()));
                        return Err(e);
                    }
                };
                if let Err(e) = self.record_outcome(ticket, &stage.id, &report.outcome).await {
                    self.state.finish_run(ticket, Some(e.to_string()));
                    return Err(e);
                }

                match report.outcome {
                    StageOutcome::Succeeded => tracker.record_completion(&stage.id),
                    StageOutcome::Failed { .. } => tracker.record_failure(&stage.id),
                    StageOutcome::Stopped => {
                        tracker.record_skip(&stage.id);
                        stopped = true;
                    }
                }
                reports.push(report);
            }

            let processed = u64::try_from(tracker.processed()).unwrap_or(u64::MAX);
            let progress = self.publish(ticket, StateUpdate::new().progress(processed, total));
            if progress == ApplyOutcome::Stale {
                warn!(entity_id, "Pipeline run was reset, abandoning it");
                stopped = true;
            }
            if stopped {
                break;
            }
        }

        for stage in remaining {
            tracker.record_skip(&stage.id);
        }

        let error = (!tracker.failed().is_empty())
            .then(|| format!("Failed stages: {}", tracker.failed().join(", ")));
        self.state.finish_run(ticket, error);

        let report = PipelineReport {
            entity_id: entity_id.to_string(),
            run_id: ticket.run_id,
            completed: tracker.completed().to_vec(),
            failed: tracker.failed().to_vec(),
            skipped: tracker.skipped().to_vec(),
            stopped,
            duration_ms: elapsed_ms(start),
            stages: reports,
        };
        info!(
            entity_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            stopped,
            "Pipeline finished"
        );
        Ok(report)
    }
}

/// Retries run the stage through the same path, minus failure bookkeeping,
/// which the coordinator owns.
#[async_trait]
impl StageInvoker for Orchestrator {
    async fn invoke(&self, entity_id: &str, stage_id: &str) -> Result<StageOutcome, CascadeError> {
        let args = StageArgs::default();
        let (stage, ticket) = self.prepare_stage(entity_id, stage_id, &args)?;
        let report = self.run_prepared_stage(&ticket, &stage, &args, false).await?;
        Ok(report.outcome)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancellation::{FileStopSignals, InMemoryStopSignals};
    use crate::errors::FailureKind;
    use crate::events::CollectingEventSink;
    use crate::pipeline::FailureMode;
    use crate::registry::{Executable, StageScope};
    use crate::retry::{FailureRecord, InMemoryFailureStore, RetryCoordinator, RetryPolicy};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn sh(id: &str, script: &str) -> StageDefinition {
        StageDefinition::new(id, Executable::new("sh").arg("-c").arg(script).arg("sh"))
    }

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        failures: Arc<InMemoryFailureStore>,
        events: Arc<CollectingEventSink>,
    }

    fn fixture(stages: Vec<StageDefinition>, follow_up: Option<&str>) -> Fixture {
        fixture_with(
            stages,
            follow_up,
            Arc::new(InMemoryStopSignals::new()),
            RunnerConfig::default(),
        )
    }

    fn fixture_with(
        stages: Vec<StageDefinition>,
        follow_up: Option<&str>,
        signals: Arc<dyn StopSignals>,
        config: RunnerConfig,
    ) -> Fixture {
        let mut builder = StageRegistry::builder();
        for stage in stages {
            builder = builder.stage(stage);
        }
        if let Some(id) = follow_up {
            builder = builder.follow_up(id);
        }
        let failures = Arc::new(InMemoryFailureStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = Orchestrator::new(
            Arc::new(builder.build().unwrap()),
            Arc::new(ExecutionStateStore::new()),
            signals,
            failures.clone(),
        )
        .with_runner_config(config.with_stop_poll_interval(Duration::from_millis(10)))
        .with_event_sink(events.clone());
        Fixture {
            orchestrator: Arc::new(orchestrator),
            failures,
            events,
        }
    }

    #[tokio::test]
    async fn test_stage_success_clears_failure_and_syncs_status() {
        let f = fixture(
            vec![sh("personas", "echo done"), sh("status_sync", "true")],
            Some("status_sync"),
        );
        f.failures
            .upsert(FailureRecord::new("E1", "personas", FailureKind::Timeout, "slow"))
            .await
            .unwrap();

        let report = f
            .orchestrator
            .run_stage("E1", "personas", &StageArgs::default())
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.follow_up.unwrap().outcome, StageOutcome::Succeeded);
        assert!(f.failures.is_empty());

        let state = f.orchestrator.state().get("E1");
        assert!(!state.is_running);
        assert!(state.error.is_none());
        assert!(state.completed_at.is_some());
        assert_eq!(state.logs.first().map(String::as_str), Some("personas: started"));
        assert_eq!(
            f.events.event_types(),
            vec![events::STAGE_STARTED, events::STAGE_COMPLETED]
        );
    }

    #[tokio::test]
    async fn test_stage_failure_is_recorded() {
        let f = fixture(vec![sh("biografias", "echo broken >&2; exit 3")], None);

        let report = f
            .orchestrator
            .run_stage("E1", "biografias", &StageArgs::default())
            .await
            .unwrap();

        assert!(!report.succeeded());
        let record = f.failures.get("E1", "biografias").await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.last_kind, FailureKind::ChildProcessFailure);

        let state = f.orchestrator.state().get("E1");
        assert!(!state.is_running);
        assert!(state.error.unwrap().contains("biografias"));
        assert_eq!(f.events.events_of_type(events::STAGE_FAILED).len(), 1);
    }

    #[tokio::test]
    async fn test_follow_up_failure_keeps_parent_success() {
        let f = fixture(
            vec![sh("avatares", "true"), sh("status_sync", "exit 1")],
            Some("status_sync"),
        );

        let report = f
            .orchestrator
            .run_stage("E1", "avatares", &StageArgs::default())
            .await
            .unwrap();

        assert!(report.succeeded());
        assert!(!report.follow_up.unwrap().outcome.is_success());
        assert!(f.failures.is_empty());
        assert_eq!(f.events.events_of_type(events::STAGE_FOLLOW_UP_FAILED).len(), 1);

        let state = f.orchestrator.state().get("E1");
        assert!(state.error.is_none());
        assert!(state.logs.iter().any(|l| l.contains("status sync failed")));
    }

    #[tokio::test]
    async fn test_stage_progress_lines_drive_state() {
        let f = fixture(
            vec![sh(
                "competencias",
                r#"echo '@cascade {"event":"progress","current":2,"total":5,"message":"persona 2"}'"#,
            )],
            None,
        );

        f.orchestrator
            .run_stage("E1", "competencias", &StageArgs::default())
            .await
            .unwrap();

        let state = f.orchestrator.state().get("E1");
        assert_eq!((state.progress_current, state.progress_total), (2, 5));
        assert!(state.logs.contains(&"competencias: persona 2".to_string()));
    }

    const POLLS_STOP_FILE: &str = r#"i=0
        while [ $i -lt 200 ]; do
            if [ -f "$CASCADE_STOP_FILE" ]; then
                echo '@cascade {"event":"result","status":"stopped"}'
                exit 0
            fi
            sleep 0.02
            i=$((i+1))
        done
        exit 1"#;

    #[tokio::test]
    async fn test_stage_honours_durable_stop_marker() {
        let dir = TempDir::new().unwrap();
        let signals: Arc<dyn StopSignals> = Arc::new(FileStopSignals::new(dir.path()));
        let f = fixture_with(
            vec![sh("avatares", POLLS_STOP_FILE)],
            None,
            Arc::clone(&signals),
            RunnerConfig::default(),
        );

        let orchestrator = Arc::clone(&f.orchestrator);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            orchestrator.request_stop("avatares").await.unwrap();
        });

        let report = assert_ok!(
            f.orchestrator
                .run_stage("E1", "avatares", &StageArgs::default())
                .await
        );
        stopper.await.unwrap();

        assert_eq!(report.outcome, StageOutcome::Stopped);
        assert!(!report.output.killed_after_stop);
        assert_eq!(f.events.events_of_type(events::STAGE_STOPPED).len(), 1);

        let marker = signals.marker_path("avatares").unwrap();
        assert!(!marker.exists());
        assert!(!assert_ok!(signals.is_stop_requested("avatares").await));

        let record = f.failures.get("E1", "avatares").await.unwrap().unwrap();
        assert_eq!(record.last_kind, FailureKind::Stopped);
    }

    #[tokio::test]
    async fn test_ignored_stop_marker_is_killed_after_grace() {
        let dir = TempDir::new().unwrap();
        let signals: Arc<dyn StopSignals> = Arc::new(FileStopSignals::new(dir.path()));
        let f = fixture_with(
            vec![sh("workflows", "exec sleep 10")],
            None,
            Arc::clone(&signals),
            RunnerConfig::default().with_stop_grace(Duration::from_millis(100)),
        );
        assert_ok!(f.orchestrator.request_stop("workflows").await);

        let started = std::time::Instant::now();
        let report = assert_ok!(
            f.orchestrator
                .run_stage("E1", "workflows", &StageArgs::default())
                .await
        );

        assert!(report.output.killed_after_stop);
        assert_eq!(report.outcome, StageOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!signals.marker_path("workflows").unwrap().exists());
        assert_eq!(f.events.events_of_type(events::STAGE_STOPPED).len(), 1);
        assert!(!f.orchestrator.state().is_running("E1"));
    }

    #[tokio::test]
    async fn test_reset_mid_stage_skips_failure_bookkeeping() {
        let f = fixture(vec![sh("biografias", "sleep 0.3; exit 1")], None);
        f.failures
            .upsert(FailureRecord::new("E1", "biografias", FailureKind::Timeout, "slow"))
            .await
            .unwrap();

        let orchestrator = Arc::clone(&f.orchestrator);
        let failures = Arc::clone(&f.failures);
        let resetter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            orchestrator.reset("E1").await.unwrap();
            failures.clear("E1").await.unwrap();
        });

        let report = assert_ok!(
            f.orchestrator
                .run_stage("E1", "biografias", &StageArgs::default())
                .await
        );
        resetter.await.unwrap();

        assert!(!report.succeeded());
        assert!(f.failures.is_empty());
        let state = f.orchestrator.state().get("E1");
        assert!(!state.is_running);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_busy_entity_is_rejected() {
        let f = fixture(vec![sh("workflows", "sleep 0.3")], None);

        let ticket = f
            .orchestrator
            .start_stage("E1", "workflows", StageArgs::default())
            .unwrap();
        let err = f
            .orchestrator
            .run_stage("E1", "workflows", &StageArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CascadeError::EntityBusy(_)));

        // a different entity is independent
        let other = f
            .orchestrator
            .start_stage("E2", "workflows", StageArgs::default())
            .unwrap();
        assert_ne!(ticket.run_id, other.run_id);
    }

    #[tokio::test]
    async fn test_unknown_stage_and_bad_args() {
        let f = fixture(vec![sh("personas", "true")], None);

        let err = assert_err!(
            f.orchestrator
                .run_stage("E1", "nope", &StageArgs::default())
                .await
        );
        assert!(matches!(err, CascadeError::UnknownStage(_)));

        let err = f
            .orchestrator
            .run_stage("E1", "personas", &StageArgs::default().with_arg("--x", "1"))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(!f.orchestrator.state().is_running("E1"));
    }

    fn pipeline_stages(failing: &str) -> Vec<StageDefinition> {
        let stage = |id: &str, deps: &[&str]| {
            let script = if id == failing { "exit 1" } else { "true" };
            sh(id, script).depends_on(deps)
        };
        vec![
            stage("personas", &[]),
            stage("biografias", &["personas"]),
            stage("atribuicoes", &["biografias"]),
            stage("auditoria", &["personas"]),
        ]
    }

    #[tokio::test]
    async fn test_pipeline_fail_fast() {
        let f = fixture(pipeline_stages("biografias"), None);

        let report = f
            .orchestrator
            .run_pipeline("E1", &PipelineRequest::new())
            .await
            .unwrap();

        assert_eq!(report.completed, vec!["personas"]);
        assert_eq!(report.failed, vec!["biografias"]);
        assert_eq!(report.skipped, vec!["atribuicoes", "auditoria"]);
        assert!(!report.succeeded());

        let state = f.orchestrator.state().get("E1");
        assert!(!state.is_running);
        assert_eq!((state.progress_current, state.progress_total), (4, 4));
        assert!(f.failures.get("E1", "biografias").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pipeline_continue_skips_dependents_only() {
        let f = fixture(pipeline_stages("biografias"), None);
        let request = PipelineRequest::new().with_failure_mode(FailureMode::ContinueOnFailure);

        let report = f.orchestrator.run_pipeline("E1", &request).await.unwrap();

        assert_eq!(report.completed, vec!["personas", "auditoria"]);
        assert_eq!(report.failed, vec!["biografias"]);
        assert_eq!(report.skipped, vec!["atribuicoes"]);
    }

    #[tokio::test]
    async fn test_pipeline_selection() {
        let f = fixture(pipeline_stages(""), None);

        let report = f
            .orchestrator
            .run_pipeline("E1", &PipelineRequest::new().starting_from("atribuicoes"))
            .await
            .unwrap();
        assert_eq!(report.completed, vec!["atribuicoes", "auditoria"]);

        let report = f
            .orchestrator
            .run_pipeline("E1", &PipelineRequest::new().only(&["auditoria", "personas"]))
            .await
            .unwrap();
        assert_eq!(report.completed, vec!["personas", "auditoria"]);

        let err = f
            .orchestrator
            .run_pipeline("E1", &PipelineRequest::new().only(&["ghost"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CascadeError::UnknownStage(_)));

        let err = f
            .orchestrator
            .run_pipeline("E1", &PipelineRequest::new().only(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CascadeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_pipeline_stop_between_stages() {
        let f = fixture(
            vec![
                sh("personas", "sleep 0.3"),
                sh("biografias", "true"),
                sh("avatares", "true"),
            ],
            None,
        );

        let orchestrator = Arc::clone(&f.orchestrator);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            orchestrator.request_stop(PIPELINE_SCOPE).await.unwrap();
        });

        let report = f
            .orchestrator
            .run_pipeline("E1", &PipelineRequest::new())
            .await
            .unwrap();
        stopper.await.unwrap();

        assert!(report.stopped);
        assert_eq!(report.completed, vec!["personas"]);
        assert_eq!(report.skipped, vec!["biografias", "avatares"]);
        assert!(!f
            .orchestrator
            .signals()
            .is_stop_requested(PIPELINE_SCOPE)
            .await
            .unwrap());
        assert!(!f.orchestrator.state().is_running("E1"));
    }

    #[tokio::test]
    async fn test_reset_makes_running_pipeline_stale() {
        let f = fixture(
            vec![sh("personas", "sleep 0.2"), sh("biografias", "true")],
            None,
        );

        let orchestrator = Arc::clone(&f.orchestrator);
        let resetter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orchestrator.reset("E1").await.unwrap();
        });

        let report = f
            .orchestrator
            .run_pipeline("E1", &PipelineRequest::new())
            .await
            .unwrap();
        resetter.await.unwrap();

        assert!(report.stopped);
        assert_eq!(report.skipped, vec!["biografias"]);
        let state = f.orchestrator.state().get("E1");
        assert!(!state.is_running);
        assert!(state.logs.is_empty());
        assert_eq!(f.events.events_of_type(events::EXECUTION_RESET).len(), 1);
    }

    #[tokio::test]
    async fn test_retry_through_orchestrator() {
        let f = fixture(vec![sh("personas", "true"), sh("biografias", "true")], None);
        f.failures
            .upsert(FailureRecord::new("E1", "biografias", FailureKind::Timeout, "slow").with_attempts(1))
            .await
            .unwrap();

        let coordinator = RetryCoordinator::new(
            Arc::clone(f.orchestrator.registry()),
            f.failures.clone(),
            f.orchestrator.clone(),
        );
        let summary = coordinator
            .retry(
                "E1",
                &StageScope::All,
                &RetryPolicy::new().with_delay_ms(0),
                false,
            )
            .await
            .unwrap();

        assert_eq!(summary.successes, 1);
        assert!(f.failures.is_empty());
        assert!(!f.orchestrator.state().is_running("E1"));
    }
}
