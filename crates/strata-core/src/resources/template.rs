use super::{validate_base, Resource, ResourceError};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Node label used for zone affinity when a template does not name one
pub const DEFAULT_ZONE_NODE_LABEL: &str = "topology.kubernetes.io/zone";

/// Desired-state object from which versioned, zone-sharded StatefulSets are cut
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTemplate {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: WorkloadTemplateSpec,
}

fn default_api_version() -> String {
    WorkloadTemplate::API_VERSION.to_string()
}

fn default_kind() -> String {
    WorkloadTemplate::KIND.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTemplateSpec {
    /// StatefulSet every version is derived from
    pub template: StatefulSet,

    /// Availability zones to shard into; empty means a single unsharded instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,

    /// Node label matched against the zone name for affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_node_label: Option<String>,

    /// Cut a new version when referenced ConfigMaps or Secrets change
    #[serde(default)]
    pub update_on_config_change: bool,
}

impl WorkloadTemplate {
    pub fn new(namespace: &str, name: &str, spec: WorkloadTemplateSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    pub fn zone_node_label(&self) -> &str {
        self.spec
            .zone_node_label
            .as_deref()
            .unwrap_or(DEFAULT_ZONE_NODE_LABEL)
    }

    pub fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec
            .template
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
    }

    /// Replica count of the embedded StatefulSet (defaults to 1)
    pub fn replicas(&self) -> i32 {
        self.spec
            .template
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1)
    }

    pub fn is_sharded(&self) -> bool {
        !self.spec.zones.is_empty()
    }
}

impl Resource for WorkloadTemplate {
    const API_VERSION: &'static str = "strata.io/v1alpha1";
    const KIND: &'static str = "WorkloadTemplate";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(&self.metadata)?;

        // Instances live in the template's namespace
        if self.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
            return Err(ResourceError::MissingField("metadata.namespace".to_string()));
        }

        if self.spec.template.spec.is_none() {
            return Err(ResourceError::MissingField("spec.template.spec".to_string()));
        }

        Ok(())
    }
}
