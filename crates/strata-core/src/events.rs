use crate::types::{GroupVersionKind, ResourceKey};
use serde::{Deserialize, Serialize};

/// Kind of change a store event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A change notification emitted by the resource store after every write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub event_type: WatchEventType,
    /// Identity of the changed object
    pub resource_key: ResourceKey,
    /// The object as written (last-known state for deletions)
    pub object: serde_json::Value,
    pub resource_version: String,
}

impl ResourceEvent {
    pub fn new(
        event_type: WatchEventType,
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            resource_key,
            object,
            resource_version: resource_version.into(),
        }
    }

    /// Create an ADDED event
    pub fn added(key: ResourceKey, object: serde_json::Value, rv: impl Into<String>) -> Self {
        Self::new(WatchEventType::Added, key, object, rv)
    }

    /// Create a MODIFIED event
    pub fn modified(key: ResourceKey, object: serde_json::Value, rv: impl Into<String>) -> Self {
        Self::new(WatchEventType::Modified, key, object, rv)
    }

    /// Create a DELETED event
    pub fn deleted(key: ResourceKey, object: serde_json::Value, rv: impl Into<String>) -> Self {
        Self::new(WatchEventType::Deleted, key, object, rv)
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.resource_key.gvk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_event_serde_roundtrip() {
        let gvk = GroupVersionKind::from_api_version_kind("v1", "ConfigMap");
        let key = ResourceKey::new(gvk, "default", "settings");
        let object = serde_json::json!({"data": {"k": "v"}});

        let event = ResourceEvent::modified(key, object.clone(), "rv-2");
        let serialized = serde_json::to_string(&event).unwrap();
        assert!(serialized.contains("\"MODIFIED\""));

        let decoded: ResourceEvent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(decoded.event_type, WatchEventType::Modified);
        assert_eq!(decoded.gvk().kind, "ConfigMap");
        assert_eq!(decoded.object, object);
        assert_eq!(decoded.resource_version, "rv-2");
    }
}
