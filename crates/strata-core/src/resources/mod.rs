pub mod config;
pub mod template;

pub use config::{ConfigKind, ConfigObject, ConfigRef};
pub use template::{WorkloadTemplate, WorkloadTemplateSpec, DEFAULT_ZONE_NODE_LABEL};

use crate::{GroupVersionKind, ResourceKey, ResourceVersion};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<(), ResourceError> {
    let name = metadata
        .name
        .as_ref()
        .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;

    if !is_valid_name(name) {
        return Err(ResourceError::InvalidName(name.clone()));
    }

    if let Some(namespace) = &metadata.namespace {
        if !is_valid_name(namespace) {
            return Err(ResourceError::InvalidNamespace(namespace.clone()));
        }
    }

    Ok(())
}

/// Trait for resources kept in the store
///
/// The type-level `API_VERSION`/`KIND` pair lets callers build keys and list
/// prefixes without holding an instance.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// API version of this resource type
    const API_VERSION: &'static str;

    /// Kind of this resource type
    const KIND: &'static str;

    /// Get the metadata of this resource
    fn metadata(&self) -> &ObjectMeta;

    /// Get mutable metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// GroupVersionKind of the resource type
    fn type_gvk() -> GroupVersionKind {
        GroupVersionKind::from_api_version_kind(Self::API_VERSION, Self::KIND)
    }

    /// Key of the instance of this type with the given namespace and name
    fn key_for(namespace: &str, name: &str) -> ResourceKey {
        ResourceKey::new(Self::type_gvk(), namespace, name)
    }

    /// Get the ResourceKey
    fn resource_key(&self) -> Result<ResourceKey, ResourceError> {
        let metadata = self.metadata();
        let name = metadata
            .name
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;
        let namespace = metadata.namespace.clone().unwrap_or_default();

        Ok(ResourceKey::new(Self::type_gvk(), namespace, name))
    }

    /// Name, or an empty string for unnamed objects
    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Namespace, or an empty string for cluster-scoped objects
    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Get the resource version
    fn resource_version(&self) -> Option<ResourceVersion> {
        self.metadata()
            .resource_version
            .as_ref()
            .map(ResourceVersion::new)
    }

    /// Get the UID
    fn uid(&self) -> Option<String> {
        self.metadata().uid.clone()
    }

    /// Set the UID
    fn set_uid(&mut self, uid: String) {
        self.metadata_mut().uid = Some(uid);
    }

    /// Validate the resource
    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata())
    }
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Validate a resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    // Must contain only lowercase alphanumeric, '-', or '.'
    // Must start and end with alphanumeric
    let bytes = name.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if !alnum(&bytes[0]) || !alnum(&bytes[bytes.len() - 1]) {
        return false;
    }

    bytes.iter().all(|b| alnum(b) || *b == b'-' || *b == b'.')
}

impl Resource for ConfigMap {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "ConfigMap";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for Secret {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Secret";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for StatefulSet {
    const API_VERSION: &'static str = "apps/v1";
    const KIND: &'static str = "StatefulSet";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(&self.metadata)?;

        if self.spec.is_none() {
            return Err(ResourceError::MissingField("spec".to_string()));
        }

        Ok(())
    }
}
