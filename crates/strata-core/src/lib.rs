//! Strata Core - Resource types shared by the Strata controller
//!
//! This crate provides:
//! - The `WorkloadTemplate` resource and the `Resource` trait
//! - Configuration object references (ConfigMap / Secret)
//! - Error types with miette diagnostics
//! - Type-safe resource keys and identifiers
//! - Serialization helpers

pub mod error;
pub mod events;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use error::{Result, StrataError};
pub use events::{ResourceEvent, WatchEventType};
pub use resources::{
    is_valid_name, ConfigKind, ConfigObject, ConfigRef, Resource, ResourceError,
    WorkloadTemplate, WorkloadTemplateSpec, DEFAULT_ZONE_NODE_LABEL,
};
pub use types::{GroupVersionKind, ResourceKey, ResourceVersion};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::apps::v1::StatefulSet;
pub use k8s_openapi::api::core::v1::{ConfigMap, PodSpec, Secret};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

/// Serialize a resource to JSON
pub fn to_json<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_json::to_string(resource).map_err(|e| {
        StrataError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Decode a resource from an already-parsed JSON value
pub fn from_json_value<T: for<'de> serde::Deserialize<'de>>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        StrataError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Split a (possibly multi-document) YAML stream into JSON values.
///
/// Empty documents (e.g. a trailing `---`) are skipped.
pub fn from_yaml_documents(data: &str) -> Result<Vec<serde_json::Value>> {
    use serde::Deserialize;

    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| {
            StrataError::serialization_error(
                format!("Failed to parse YAML document: {}", e),
                Some(Box::new(e)),
            )
        })?;

        if value.is_null() {
            continue;
        }

        let json = serde_json::to_value(&value).map_err(|e| {
            StrataError::serialization_error(
                format!("YAML document is not representable as JSON: {}", e),
                Some(Box::new(e)),
            )
        })?;
        documents.push(json);
    }

    Ok(documents)
}
