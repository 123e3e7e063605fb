use strata_core::{GroupVersionKind, ResourceKey};

/// Key encoder for storage keys
///
/// Namespaced objects live at `{apiVersion}/{kind}/{namespace}/{name}`,
/// cluster-scoped ones at `{apiVersion}/{kind}/{name}`. The group part of an
/// apiVersion contributes one extra segment, so parsing works from the right.
pub struct KeyEncoder;

impl KeyEncoder {
    /// Encode a resource key
    pub fn encode_resource_key(key: &ResourceKey) -> String {
        key.storage_key()
    }

    /// Prefix covering every object of a kind, optionally within one namespace
    pub fn encode_prefix(gvk: &GroupVersionKind, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}/{}/{}/", gvk.api_version(), gvk.kind, ns),
            None => format!("{}/{}/", gvk.api_version(), gvk.kind),
        }
    }

    /// Parse a namespaced storage key back into a ResourceKey
    pub fn parse_key(key: &str) -> Option<ResourceKey> {
        let parts: Vec<&str> = key.split('/').collect();

        let (api_version, kind, namespace, name) = match parts.as_slice() {
            [version, kind, ns, name] => (version.to_string(), *kind, *ns, *name),
            [group, version, kind, ns, name] => {
                (format!("{}/{}", group, version), *kind, *ns, *name)
            }
            _ => return None,
        };

        if kind.is_empty() || name.is_empty() {
            return None;
        }

        Some(ResourceKey::new(
            GroupVersionKind::from_api_version_kind(&api_version, kind),
            namespace,
            name,
        ))
    }
}
