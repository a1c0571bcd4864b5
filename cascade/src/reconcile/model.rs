//! Workflow records on both sides of the reconciliation.

use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A workflow as listed by the external registry.
///
/// Everything besides the identity fields is kept as the opaque definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWorkflow {
    /// Registry-assigned id, the primary join key.
    pub id: String,
    /// Display name, the fallback join key.
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
    /// Remaining fields of the listing.
    #[serde(flatten)]
    pub definition: serde_json::Map<String, serde_json::Value>,
}

impl RemoteWorkflow {
    /// Creates a remote workflow with an empty definition.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            active: false,
            updated_at: None,
            definition: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Sets one definition field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.definition.insert(key.into(), value);
        self
    }
}

/// A row of the local workflow mirror.
///
/// `local_id` never changes; `external_id` is the join key and may be
/// rewritten when a workflow is re-created remotely and matched by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalWorkflow {
    /// Stable id of the local row.
    pub local_id: Uuid,
    /// Id in the external registry, once known.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Owning entity.
    pub entity_id: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    /// Copy of the remote definition.
    #[serde(default)]
    pub definition: serde_json::Value,
    /// SHA-256 of `definition`, used to detect remote changes.
    #[serde(default)]
    pub definition_hash: Option<String>,
    /// Last modification time reported by the external registry.
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
    /// When the row last changed because of a sync.
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
    /// Local-only data; never touched by reconciliation.
    #[serde(default)]
    pub annotations: serde_json::Map<String, serde_json::Value>,
}

impl ExternalWorkflow {
    /// Creates a local row not yet linked to an external workflow.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            external_id: None,
            entity_id: entity_id.into(),
            name: name.into(),
            active: false,
            definition: serde_json::Value::Null,
            definition_hash: None,
            updated_at: None,
            synced_at: None,
            annotations: serde_json::Map::new(),
        }
    }

    /// Links the row to an external id.
    #[must_use]
    pub fn linked_to(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Adds a local annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.annotations.insert(key.into(), value);
        self
    }

    /// Returns the row with external fields overwritten, or `None` if
    /// nothing would change.
    #[must_use]
    pub fn merged_with(&self, remote: &RemoteWorkflow, now: Timestamp) -> Option<Self> {
        let hash = definition_hash(&remote.definition);
        let unchanged = self.external_id.as_deref() == Some(remote.id.as_str())
            && self.name == remote.name
            && self.active == remote.active
            && self.definition_hash.as_deref() == Some(hash.as_str())
            && self.updated_at == remote.updated_at;
        if unchanged {
            return None;
        }

        Some(Self {
            external_id: Some(remote.id.clone()),
            name: remote.name.clone(),
            active: remote.active,
            definition: serde_json::Value::Object(remote.definition.clone()),
            definition_hash: Some(hash),
            updated_at: remote.updated_at,
            synced_at: Some(now),
            ..self.clone()
        })
    }
}

/// Hex SHA-256 of a definition's canonical JSON.
#[must_use]
pub fn definition_hash(definition: &serde_json::Map<String, serde_json::Value>) -> String {
    // serde_json maps are key-ordered, so this encoding is canonical
    let encoded = serde_json::to_vec(definition).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

/// A row that could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    /// Name of the external workflow.
    pub workflow: String,
    /// Id of the external workflow.
    pub external_id: String,
    /// Why the row failed.
    pub message: String,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// Workflows listed by the external registry.
    pub total: usize,
    /// Local rows that changed.
    pub updated: usize,
    /// Always zero; unmatched workflows are reported, not created.
    pub created: usize,
    /// External workflows with no local row.
    pub unmatched: usize,
    /// Rows that failed; the pass carries on past them.
    pub errors: Vec<SyncError>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;
    use serde_json::json;

    #[test]
    fn test_remote_definition_is_flattened() {
        let remote: RemoteWorkflow = serde_json::from_value(json!({
            "id": "wf-1",
            "name": "Onboarding",
            "active": true,
            "nodes": [{"type": "webhook"}],
            "connections": {}
        }))
        .unwrap();

        assert!(remote.definition.contains_key("nodes"));
        assert!(!remote.definition.contains_key("name"));
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = RemoteWorkflow::new("1", "a")
            .with_field("nodes", json!([]))
            .with_field("connections", json!({}));
        let b = RemoteWorkflow::new("1", "a")
            .with_field("connections", json!({}))
            .with_field("nodes", json!([]));
        assert_eq!(definition_hash(&a.definition), definition_hash(&b.definition));
    }

    #[test]
    fn test_merge_preserves_local_fields() {
        let row = ExternalWorkflow::new("E1", "Onboarding")
            .with_annotation("owner", json!("ops"));
        let remote = RemoteWorkflow::new("wf-1", "Onboarding v2").active(true);

        let merged = row.merged_with(&remote, now_utc()).unwrap();
        assert_eq!(merged.local_id, row.local_id);
        assert_eq!(merged.entity_id, "E1");
        assert_eq!(merged.annotations.get("owner"), Some(&json!("ops")));
        assert_eq!(merged.external_id.as_deref(), Some("wf-1"));

        assert!(merged.merged_with(&remote, now_utc()).is_none());
    }
}
