//! File-backed stop markers that survive the orchestrator process.

use super::{check_scope, StopAck, StopSignals};
use crate::errors::CascadeError;
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Marker {
    scope: String,
    requested_at: Timestamp,
}

/// Stop signals stored as `.stop_<scope>` files in a directory.
///
/// Child processes receive the marker path and may poll it directly.
#[derive(Debug, Clone)]
pub struct FileStopSignals {
    dir: PathBuf,
}

impl FileStopSignals {
    /// Creates signals rooted at `dir`; the directory is created on first use.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The marker directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, scope: &str) -> PathBuf {
        self.dir.join(format!(".stop_{scope}"))
    }

    async fn read_marker(path: &Path) -> Result<Option<Marker>, CascadeError> {
        match fs::read(path).await {
            // a marker written by hand without a body still counts
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).unwrap_or_else(|_| Marker {
                scope: String::new(),
                requested_at: now_utc(),
            }))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CascadeError::storage(format!(
                "Cannot read stop marker {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl StopSignals for FileStopSignals {
    async fn request_stop(&self, scope: &str) -> Result<StopAck, CascadeError> {
        check_scope(scope)?;
        let path = self.path_for(scope);

        if let Some(marker) = Self::read_marker(&path).await? {
            return Ok(StopAck {
                scope: scope.to_string(),
                requested_at: marker.requested_at,
                already_requested: true,
            });
        }

        fs::create_dir_all(&self.dir).await?;
        let marker = Marker {
            scope: scope.to_string(),
            requested_at: now_utc(),
        };
        fs::write(&path, serde_json::to_vec(&marker)?)
            .await
            .map_err(|e| CascadeError::storage(format!("Cannot write stop marker: {e}")))?;

        info!(scope, path = %path.display(), "Stop requested");
        Ok(StopAck {
            scope: marker.scope,
            requested_at: marker.requested_at,
            already_requested: false,
        })
    }

    async fn is_stop_requested(&self, scope: &str) -> Result<bool, CascadeError> {
        check_scope(scope)?;
        match fs::metadata(self.path_for(scope)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CascadeError::storage(format!("Cannot stat stop marker: {e}"))),
        }
    }

    async fn consume_stop(&self, scope: &str) -> Result<bool, CascadeError> {
        check_scope(scope)?;
        // remove_file succeeds for exactly one caller
        match fs::remove_file(self.path_for(scope)).await {
            Ok(()) => {
                debug!(scope, "Stop marker consumed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CascadeError::storage(format!("Cannot remove stop marker: {e}"))),
        }
    }

    async fn clear_stop(&self, scope: &str) -> Result<(), CascadeError> {
        self.consume_stop(scope).await.map(|_| ())
    }

    fn marker_path(&self, scope: &str) -> Option<PathBuf> {
        Some(self.path_for(scope))
    }
}
