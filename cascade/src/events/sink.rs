//! Event sinks.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Receives orchestration lifecycle events.
///
/// Emission is fire-and-forget from the caller's point of view: a sink must
/// not fail the operation that produced the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes one event, e.g. `stage.started` with its entity and stage.
    async fn emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to the tracing subscriber.
///
/// `entity_id` and `stage_id` in the payload are lifted into structured
/// fields.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs at debug level.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

fn field<'a>(data: Option<&'a Value>, key: &str) -> &'a str {
    data.and_then(|d| d.get(key))
        .and_then(Value::as_str)
        .unwrap_or("")
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        let data = data.as_ref();
        let entity_id = field(data, "entity_id");
        let stage_id = field(data, "stage_id");
        if self.level == Level::DEBUG {
            debug!(event = event_type, entity_id, stage_id, payload = ?data, "Lifecycle event");
        } else {
            info!(event = event_type, entity_id, stage_id, payload = ?data, "Lifecycle event");
        }
    }
}

/// Records events in memory for later inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.lock().clone()
    }

    /// Event names in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Events whose name starts with `prefix`, e.g. `"stage."`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.lock().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_logging_sink_tolerates_any_payload() {
        NoOpEventSink.emit("stage.started", None).await;
        let sink = LoggingEventSink::debug();
        sink.emit("stage.completed", Some(json!({"entity_id": "E1", "stage_id": "personas"})))
            .await;
        sink.emit("retry.completed", Some(json!(["not", "an", "object"]))).await;
        sink.emit("stop.requested", None).await;
    }

    #[test]
    fn test_field_extraction() {
        let data = json!({"entity_id": "E1", "stage_id": 3});
        assert_eq!(field(Some(&data), "entity_id"), "E1");
        assert_eq!(field(Some(&data), "stage_id"), "");
        assert_eq!(field(None, "entity_id"), "");
    }

    #[tokio::test]
    async fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        sink.emit("stage.started", None).await;
        sink.emit("stage.completed", None).await;
        sink.emit("retry.attempt", Some(json!({"stage_id": "biografias"}))).await;

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(
            sink.event_types(),
            vec!["stage.started", "stage.completed", "retry.attempt"]
        );
        assert_eq!(sink.events()[2].1, Some(json!({"stage_id": "biografias"})));
    }
}
