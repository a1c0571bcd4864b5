//! Concurrency-safe execution state store.

use super::model::{ApplyOutcome, ExecutionState, RunTicket, StateUpdate};
use crate::errors::CascadeError;
use crate::utils::now_utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default bound on retained log lines per entity.
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 500;

/// Configuration for [`ExecutionStateStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateStoreConfig {
    /// Oldest log lines are dropped beyond this many.
    pub max_log_entries: usize,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
        }
    }
}

impl StateStoreConfig {
    /// Sets the log bound.
    #[must_use]
    pub fn with_max_log_entries(mut self, max: usize) -> Self {
        self.max_log_entries = max.max(1);
        self
    }
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    state: ExecutionState,
}

/// Single authoritative record of what is running, keyed by entity.
///
/// Every entity has its own mutex-guarded slot; all mutation of a slot goes
/// through this type, so concurrent updates serialize and readers always get a
/// whole snapshot.
#[derive(Debug, Default)]
pub struct ExecutionStateStore {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    config: StateStoreConfig,
}

impl ExecutionStateStore {
    /// Creates a store with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with the given configuration.
    #[must_use]
    pub fn with_config(config: StateStoreConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
        }
    }

    fn slot(&self, entity_id: &str) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.get(entity_id) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(entity_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Slot {
                        generation: 0,
                        state: ExecutionState::idle(entity_id),
                    }))
                })
                .value(),
        )
    }

    fn check_entity(entity_id: &str) -> Result<(), CascadeError> {
        if entity_id.trim().is_empty() {
            return Err(CascadeError::validation("entityId is required"));
        }
        Ok(())
    }

    /// Returns a snapshot of the entity's state.
    #[must_use]
    pub fn get(&self, entity_id: &str) -> ExecutionState {
        self.slots.get(entity_id).map_or_else(
            || ExecutionState::idle(entity_id),
            |slot| slot.lock().state.clone(),
        )
    }

    /// Returns true if a run is active for the entity.
    #[must_use]
    pub fn is_running(&self, entity_id: &str) -> bool {
        self.slots
            .get(entity_id)
            .is_some_and(|slot| slot.lock().state.is_running)
    }

    /// Starts a run, rejecting it while another run is active.
    ///
    /// Clears logs, progress and error of the previous run.
    pub fn begin_run(
        &self,
        entity_id: &str,
        stage_id: Option<&str>,
        progress_total: u64,
    ) -> Result<RunTicket, CascadeError> {
        Self::check_entity(entity_id)?;
        let slot = self.slot(entity_id);
        let mut slot = slot.lock();

        if slot.state.is_running {
            return Err(CascadeError::EntityBusy(entity_id.to_string()));
        }

        slot.generation += 1;
        let run_id = Uuid::new_v4();
        slot.state = ExecutionState {
            entity_id: entity_id.to_string(),
            run_id: Some(run_id),
            is_running: true,
            current_stage_id: stage_id.map(str::to_string),
            progress_current: 0,
            progress_total,
            logs: Vec::new(),
            error: None,
            started_at: Some(now_utc()),
            completed_at: None,
        };

        debug!(entity_id, %run_id, "Execution run started");

        Ok(RunTicket {
            entity_id: entity_id.to_string(),
            run_id,
            generation: slot.generation,
        })
    }

    /// False once the run was reset or superseded by a newer one.
    #[must_use]
    pub fn is_current(&self, ticket: &RunTicket) -> bool {
        self.slots
            .get(&ticket.entity_id)
            .is_some_and(|slot| slot.lock().generation == ticket.generation)
    }

    /// Applies an update on behalf of a run; dropped if the run is stale.
    pub fn apply_for_run(&self, ticket: &RunTicket, update: StateUpdate) -> ApplyOutcome {
        let slot = self.slot(&ticket.entity_id);
        let mut slot = slot.lock();

        if slot.generation != ticket.generation {
            warn!(
                entity_id = %ticket.entity_id,
                run_id = %ticket.run_id,
                "Discarding update from a superseded run"
            );
            return ApplyOutcome::Stale;
        }

        self.merge(&mut slot.state, update);
        ApplyOutcome::Applied
    }

    /// Ends a run, recording its error if any.
    pub fn finish_run(&self, ticket: &RunTicket, error: Option<String>) -> ApplyOutcome {
        let mut update = StateUpdate::new().running(false);
        update.error = error;
        self.apply_for_run(ticket, update)
    }

    /// Applies an external update and returns the resulting snapshot.
    pub fn apply(&self, entity_id: &str, update: StateUpdate) -> Result<ExecutionState, CascadeError> {
        Self::check_entity(entity_id)?;
        let slot = self.slot(entity_id);
        let mut slot = slot.lock();
        self.merge(&mut slot.state, update);
        Ok(slot.state.clone())
    }

    /// Resets the entity to idle; writes from the run in flight become stale.
    pub fn reset(&self, entity_id: &str) -> Result<ExecutionState, CascadeError> {
        Self::check_entity(entity_id)?;
        let slot = self.slot(entity_id);
        let mut slot = slot.lock();

        slot.generation += 1;
        let run_id = slot.state.run_id;
        slot.state = ExecutionState {
            run_id,
            ..ExecutionState::idle(entity_id)
        };

        debug!(entity_id, "Execution state reset");
        Ok(slot.state.clone())
    }

    /// Returns the ids of entities with an active run.
    #[must_use]
    pub fn running_entities(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|entry| entry.value().lock().state.is_running)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn merge(&self, state: &mut ExecutionState, update: StateUpdate) {
        if let Some(is_running) = update.is_running {
            state.is_running = is_running;
            if is_running {
                state.completed_at = None;
                state.started_at.get_or_insert_with(now_utc);
            } else {
                state.completed_at = Some(now_utc());
            }
        }
        if let Some(stage) = update.current_stage_id {
            state.current_stage_id = Some(stage);
        }
        if let Some(total) = update.progress_total {
            state.progress_total = total;
        }
        if let Some(current) = update.progress_current {
            // never goes backwards within a run
            state.progress_current = state.progress_current.max(current);
        }
        if let Some(error) = update.error {
            state.error = Some(error);
        }
        if !update.logs.is_empty() {
            state.logs.extend(update.logs);
            let excess = state.logs.len().saturating_sub(self.config.max_log_entries);
            if excess > 0 {
                state.logs.drain(..excess);
            }
        }
    }
}
