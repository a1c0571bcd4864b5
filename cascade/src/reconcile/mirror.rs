//! Local mirror of external workflows.

use super::model::ExternalWorkflow;
use crate::errors::CascadeError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::io::ErrorKind;
use std::path::PathBuf;
use uuid::Uuid;

/// Storage for mirror rows.
#[async_trait]
pub trait WorkflowMirror: Send + Sync {
    /// Lists rows, optionally only those of one entity.
    async fn list(&self, entity_id: Option<&str>) -> Result<Vec<ExternalWorkflow>, CascadeError>;

    /// Inserts or replaces a row by `local_id`.
    async fn upsert(&self, row: ExternalWorkflow) -> Result<(), CascadeError>;
}

fn select(rows: &[ExternalWorkflow], entity_id: Option<&str>) -> Vec<ExternalWorkflow> {
    rows.iter()
        .filter(|row| entity_id.map_or(true, |e| row.entity_id == e))
        .cloned()
        .collect()
}

fn replace(rows: &mut Vec<ExternalWorkflow>, row: ExternalWorkflow) {
    match rows.iter_mut().find(|r| r.local_id == row.local_id) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

/// In-memory mirror.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowMirror {
    rows: RwLock<Vec<ExternalWorkflow>>,
}

impl InMemoryWorkflowMirror {
    /// Creates a mirror holding `rows`.
    #[must_use]
    pub fn new(rows: Vec<ExternalWorkflow>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// Returns one row by local id.
    #[must_use]
    pub fn row(&self, local_id: Uuid) -> Option<ExternalWorkflow> {
        self.rows
            .read()
            .iter()
            .find(|r| r.local_id == local_id)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl WorkflowMirror for InMemoryWorkflowMirror {
    async fn list(&self, entity_id: Option<&str>) -> Result<Vec<ExternalWorkflow>, CascadeError> {
        Ok(select(&self.rows.read(), entity_id))
    }

    async fn upsert(&self, row: ExternalWorkflow) -> Result<(), CascadeError> {
        replace(&mut self.rows.write(), row);
        Ok(())
    }
}

/// Mirror persisted as a single JSON array file.
#[derive(Debug)]
pub struct JsonFileWorkflowMirror {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileWorkflowMirror {
    /// Creates a mirror backed by `path`; a missing file is an empty mirror.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<ExternalWorkflow>, CascadeError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(CascadeError::storage(format!(
                "Cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, rows: &[ExternalWorkflow]) -> Result<(), CascadeError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CascadeError::storage(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(rows)?)
            .await
            .map_err(|e| CascadeError::storage(format!("Cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CascadeError::storage(format!("Cannot replace {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl WorkflowMirror for JsonFileWorkflowMirror {
    async fn list(&self, entity_id: Option<&str>) -> Result<Vec<ExternalWorkflow>, CascadeError> {
        let _guard = self.lock.lock().await;
        Ok(select(&self.load().await?, entity_id))
    }

    async fn upsert(&self, row: ExternalWorkflow) -> Result<(), CascadeError> {
        let _guard = self.lock.lock().await;
        let mut rows = self.load().await?;
        replace(&mut rows, row);
        self.save(&rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_filter_and_replace() {
        let a = ExternalWorkflow::new("E1", "a");
        let b = ExternalWorkflow::new("E2", "b");
        let mirror = InMemoryWorkflowMirror::new(vec![a.clone(), b]);

        assert_eq!(mirror.list(Some("E1")).await.unwrap().len(), 1);
        assert_eq!(mirror.list(None).await.unwrap().len(), 2);

        let renamed = ExternalWorkflow {
            name: "a2".into(),
            ..a.clone()
        };
        mirror.upsert(renamed).await.unwrap();
        assert_eq!(mirror.len(), 2);
        assert_eq!(mirror.row(a.local_id).unwrap().name, "a2");
    }

    #[tokio::test]
    async fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = JsonFileWorkflowMirror::new(dir.path().join("mirror/workflows.json"));
        assert!(mirror.list(None).await.unwrap().is_empty());

        let row = ExternalWorkflow::new("E1", "Onboarding").linked_to("wf-1");
        mirror.upsert(row.clone()).await.unwrap();

        let reopened = JsonFileWorkflowMirror::new(dir.path().join("mirror/workflows.json"));
        assert_eq!(reopened.list(Some("E1")).await.unwrap(), vec![row]);
    }
}
