//! Shared application state.

use crate::config::ServerConfig;
use cascade::cancellation::FileStopSignals;
use cascade::events::LoggingEventSink;
use cascade::pipeline::Orchestrator;
use cascade::reconcile::{
    HttpWorkflowRegistry, JsonFileWorkflowMirror, ReconcilerConfig, WorkflowReconciler,
};
use cascade::registry::{default_registry, StageRegistry};
use cascade::retry::{JsonFileFailureStore, RetryCoordinator};
use cascade::runner::RunnerConfig;
use cascade::state::{ExecutionStateStore, StateStoreConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handles shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub retry: Arc<RetryCoordinator>,
    /// Absent when no external workflow registry is configured.
    pub reconciler: Option<Arc<WorkflowReconciler>>,
    pub start_time: Instant,
}

impl AppState {
    /// Assembles state from already-built components.
    pub fn new(orchestrator: Arc<Orchestrator>, reconciler: Option<Arc<WorkflowReconciler>>) -> Self {
        let retry = RetryCoordinator::new(
            Arc::clone(orchestrator.registry()),
            Arc::clone(orchestrator.failures()),
            orchestrator.clone(),
        )
        .with_event_sink(Arc::new(LoggingEventSink::debug()));
        Self {
            orchestrator,
            retry: Arc::new(retry),
            reconciler,
            start_time: Instant::now(),
        }
    }

    /// Builds durable, file-backed state from configuration.
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let registry = match config.stage_registry {
            Some(ref path) => StageRegistry::from_json_file(path)?,
            None => default_registry(&config.scripts_dir)?,
        };
        tracing::info!(stages = registry.len(), "Stage registry loaded");

        let events = Arc::new(LoggingEventSink::debug());
        let state = ExecutionStateStore::with_config(
            StateStoreConfig::default().with_max_log_entries(config.max_log_entries),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(registry),
            Arc::new(state),
            Arc::new(FileStopSignals::new(config.stop_dir())),
            Arc::new(JsonFileFailureStore::new(config.failures_dir())),
        )
        .with_runner_config(RunnerConfig::default().with_stop_grace(config.stop_grace()))
        .with_event_sink(events.clone());

        let reconciler = match (&config.workflow_registry_url, &config.workflow_registry_api_key) {
            (Some(url), Some(key)) => {
                let registry = HttpWorkflowRegistry::new(
                    url.as_str(),
                    key.as_str(),
                    Duration::from_secs(config.workflow_registry_timeout_secs),
                );
                let mut reconciler = WorkflowReconciler::new(
                    Arc::new(registry),
                    Arc::new(JsonFileWorkflowMirror::new(config.mirror_path())),
                )
                .with_event_sink(events);
                if let Some(interval) = config.sync_interval() {
                    reconciler = reconciler.with_config(ReconcilerConfig::default().with_interval(interval));
                }
                Some(Arc::new(reconciler))
            }
            _ => {
                tracing::info!("Workflow registry not configured, workflow sync disabled");
                None
            }
        };

        Ok(Self::new(Arc::new(orchestrator), reconciler))
    }

    /// Server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
