//! Failure records and their storage.

use crate::errors::{CascadeError, FailureKind};
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A failed (entity, stage) pair awaiting retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub entity_id: String,
    pub stage_id: String,
    /// Retry attempts made so far.
    pub attempt_count: u32,
    pub last_error: String,
    /// Classification of the last failure; decides retriability.
    #[serde(default)]
    pub last_kind: FailureKind,
    pub first_failed_at: Timestamp,
    /// Last run of the stage, original or retry.
    pub last_attempt_at: Timestamp,
    /// Excluded from future retries; kept for reporting.
    #[serde(default)]
    pub permanent: bool,
}

impl FailureRecord {
    /// Creates a fresh record with no retry attempts.
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        stage_id: impl Into<String>,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        let now = now_utc();
        Self {
            entity_id: entity_id.into(),
            stage_id: stage_id.into(),
            attempt_count: 0,
            last_error: error.into(),
            last_kind: kind,
            first_failed_at: now,
            last_attempt_at: now,
            permanent: false,
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    /// Records the outcome of one more retry attempt.
    pub fn record_attempt(&mut self, kind: FailureKind, error: impl Into<String>, max_retries: u32) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_kind = kind;
        self.last_error = error.into();
        self.last_attempt_at = now_utc();
        if self.attempt_count >= max_retries || !kind.is_transient() {
            self.permanent = true;
        }
    }

    /// Returns true if the record may not be retried under `max_retries`.
    #[must_use]
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.permanent || self.attempt_count >= max_retries || !self.last_kind.is_transient()
    }
}

/// Durable storage for failure records, keyed by (entity, stage).
#[async_trait]
pub trait FailureStore: Send + Sync {
    /// Lists all records of an entity, ordered by stage id.
    async fn list(&self, entity_id: &str) -> Result<Vec<FailureRecord>, CascadeError>;

    /// Gets one record.
    async fn get(&self, entity_id: &str, stage_id: &str)
        -> Result<Option<FailureRecord>, CascadeError>;

    /// Inserts or replaces a record.
    async fn upsert(&self, record: FailureRecord) -> Result<(), CascadeError>;

    /// Removes a record. Returns true if it existed.
    async fn remove(&self, entity_id: &str, stage_id: &str) -> Result<bool, CascadeError>;

    /// Removes every record of an entity. Returns how many were removed.
    async fn clear(&self, entity_id: &str) -> Result<usize, CascadeError>;

    /// Records a failed stage run.
    ///
    /// An existing record keeps its attempt count; only the retry
    /// coordinator advances it.
    async fn record_failure(
        &self,
        entity_id: &str,
        stage_id: &str,
        kind: FailureKind,
        error: &str,
    ) -> Result<FailureRecord, CascadeError> {
        let record = match self.get(entity_id, stage_id).await? {
            Some(mut existing) => {
                existing.last_kind = kind;
                existing.last_error = error.to_string();
                existing.last_attempt_at = now_utc();
                existing
            }
            None => FailureRecord::new(entity_id, stage_id, kind, error),
        };
        self.upsert(record.clone()).await?;
        Ok(record)
    }
}

/// In-memory failure store.
#[derive(Debug, Default)]
pub struct InMemoryFailureStore {
    records: Mutex<HashMap<String, BTreeMap<String, FailureRecord>>>,
}

impl InMemoryFailureStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FailureStore for InMemoryFailureStore {
    async fn list(&self, entity_id: &str) -> Result<Vec<FailureRecord>, CascadeError> {
        Ok(self
            .records
            .lock()
            .get(entity_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(
        &self,
        entity_id: &str,
        stage_id: &str,
    ) -> Result<Option<FailureRecord>, CascadeError> {
        Ok(self
            .records
            .lock()
            .get(entity_id)
            .and_then(|m| m.get(stage_id))
            .cloned())
    }

    async fn upsert(&self, record: FailureRecord) -> Result<(), CascadeError> {
        self.records
            .lock()
            .entry(record.entity_id.clone())
            .or_default()
            .insert(record.stage_id.clone(), record);
        Ok(())
    }

    async fn remove(&self, entity_id: &str, stage_id: &str) -> Result<bool, CascadeError> {
        Ok(self
            .records
            .lock()
            .get_mut(entity_id)
            .and_then(|m| m.remove(stage_id))
            .is_some())
    }

    async fn clear(&self, entity_id: &str) -> Result<usize, CascadeError> {
        Ok(self
            .records
            .lock()
            .remove(entity_id)
            .map_or(0, |m| m.len()))
    }
}

/// Failure records persisted as one JSON file per entity.
///
/// Writes go through a temporary file and a rename, serialized by a lock.
#[derive(Debug)]
pub struct JsonFileFailureStore {
    dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileFailureStore {
    /// Creates a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn path_for(&self, entity_id: &str) -> Result<PathBuf, CascadeError> {
        let safe = !entity_id.is_empty()
            && !entity_id.starts_with('.')
            && entity_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe {
            return Err(CascadeError::validation(format!(
                "Invalid entity id '{entity_id}'"
            )));
        }
        Ok(self.dir.join(format!("{entity_id}.json")))
    }

    async fn load(path: &Path) -> Result<BTreeMap<String, FailureRecord>, CascadeError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let records: Vec<FailureRecord> = serde_json::from_slice(&bytes)?;
                Ok(records
                    .into_iter()
                    .map(|r| (r.stage_id.clone(), r))
                    .collect())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(CascadeError::storage(format!(
                "Cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn save(
        &self,
        path: &Path,
        records: &BTreeMap<String, FailureRecord>,
    ) -> Result<(), CascadeError> {
        if records.is_empty() {
            return match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(CascadeError::storage(format!(
                    "Cannot remove {}: {e}",
                    path.display()
                ))),
                _ => Ok(()),
            };
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CascadeError::storage(format!("Cannot create {}: {e}", self.dir.display())))?;
        let body = serde_json::to_vec_pretty(&records.values().collect::<Vec<_>>())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| CascadeError::storage(format!("Cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| CascadeError::storage(format!("Cannot replace {}: {e}", path.display())))?;
        debug!(path = %path.display(), count = records.len(), "Failure records saved");
        Ok(())
    }
}

#[async_trait]
impl FailureStore for JsonFileFailureStore {
    async fn list(&self, entity_id: &str) -> Result<Vec<FailureRecord>, CascadeError> {
        let path = self.path_for(entity_id)?;
        let _guard = self.lock.lock().await;
        Ok(Self::load(&path).await?.into_values().collect())
    }

    async fn get(
        &self,
        entity_id: &str,
        stage_id: &str,
    ) -> Result<Option<FailureRecord>, CascadeError> {
        let path = self.path_for(entity_id)?;
        let _guard = self.lock.lock().await;
        Ok(Self::load(&path).await?.remove(stage_id))
    }

    async fn upsert(&self, record: FailureRecord) -> Result<(), CascadeError> {
        let path = self.path_for(&record.entity_id)?;
        let _guard = self.lock.lock().await;
        let mut records = Self::load(&path).await?;
        records.insert(record.stage_id.clone(), record);
        self.save(&path, &records).await
    }

    async fn remove(&self, entity_id: &str, stage_id: &str) -> Result<bool, CascadeError> {
        let path = self.path_for(entity_id)?;
        let _guard = self.lock.lock().await;
        let mut records = Self::load(&path).await?;
        let removed = records.remove(stage_id).is_some();
        if removed {
            self.save(&path, &records).await?;
        }
        Ok(removed)
    }

    async fn clear(&self, entity_id: &str) -> Result<usize, CascadeError> {
        let path = self.path_for(entity_id)?;
        let _guard = self.lock.lock().await;
        let records = Self::load(&path).await?;
        let count = records.len();
        self.save(&path, &BTreeMap::new()).await?;
        Ok(count)
    }
}
