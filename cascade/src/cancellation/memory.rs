use super::{check_scope, StopAck, StopSignals};
use crate::errors::CascadeError;
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

/// In-memory stop signals for tests and single-process embedding.
///
/// Not durable across restarts.
#[derive(Debug, Default)]
pub struct InMemoryStopSignals {
    pending: Mutex<HashMap<String, Timestamp>>,
}

impl InMemoryStopSignals {
    /// Creates an empty signal set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StopSignals for InMemoryStopSignals {
    async fn request_stop(&self, scope: &str) -> Result<StopAck, CascadeError> {
        check_scope(scope)?;
        let mut pending = self.pending.lock();
        let already_requested = pending.contains_key(scope);
        let requested_at = *pending.entry(scope.to_string()).or_insert_with(now_utc);
        Ok(StopAck {
            scope: scope.to_string(),
            requested_at,
            already_requested,
        })
    }

    async fn is_stop_requested(&self, scope: &str) -> Result<bool, CascadeError> {
        check_scope(scope)?;
        Ok(self.pending.lock().contains_key(scope))
    }

    async fn consume_stop(&self, scope: &str) -> Result<bool, CascadeError> {
        check_scope(scope)?;
        Ok(self.pending.lock().remove(scope).is_some())
    }

    async fn clear_stop(&self, scope: &str) -> Result<(), CascadeError> {
        check_scope(scope)?;
        self.pending.lock().remove(scope);
        Ok(())
    }

    fn marker_path(&self, _scope: &str) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consume_is_at_most_once() {
        let signals = InMemoryStopSignals::new();
        let first = signals.request_stop("avatares").await.unwrap();
        let second = signals.request_stop("avatares").await.unwrap();

        assert!(!first.already_requested);
        assert!(second.already_requested);
        assert_eq!(first.requested_at, second.requested_at);

        assert!(signals.consume_stop("avatares").await.unwrap());
        assert!(!signals.consume_stop("avatares").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let signals = InMemoryStopSignals::new();
        signals.clear_stop("personas").await.unwrap();
        signals.request_stop("personas").await.unwrap();
        signals.clear_stop("personas").await.unwrap();
        signals.clear_stop("personas").await.unwrap();
        assert!(!signals.is_stop_requested("personas").await.unwrap());
    }
}
