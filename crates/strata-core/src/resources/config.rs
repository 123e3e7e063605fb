//! Configuration objects a pod spec can consume (ConfigMaps and Secrets).
//!
//! Hashing and reverse indexing only ever see a [`ConfigRef`]; the concrete
//! kind matters only where the object's data is fetched.

use super::Resource;
use crate::GroupVersionKind;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The two configuration kinds a pod spec can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigKind {
    ConfigMap,
    Secret,
}

impl ConfigKind {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigKind::ConfigMap => ConfigMap::KIND,
            ConfigKind::Secret => Secret::KIND,
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        match self {
            ConfigKind::ConfigMap => ConfigMap::type_gvk(),
            ConfigKind::Secret => Secret::type_gvk(),
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Reference to one configuration object: `(kind, namespace, name)`.
///
/// Ordering is by kind, then namespace, then name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigRef {
    pub kind: ConfigKind,
    pub namespace: String,
    pub name: String,
}

impl ConfigRef {
    pub fn new(kind: ConfigKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn config_map(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ConfigKind::ConfigMap, namespace, name)
    }

    pub fn secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(ConfigKind::Secret, namespace, name)
    }
}

impl fmt::Display for ConfigRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Capability shared by ConfigMaps and Secrets
pub trait ConfigObject: Resource {
    const CONFIG_KIND: ConfigKind;

    /// Reference naming this object
    fn config_ref(&self) -> ConfigRef {
        ConfigRef::new(Self::CONFIG_KIND, self.namespace(), self.name())
    }

    /// Key/value payload that feeds the content hash, keyed by field and key
    /// so that `data` and `binaryData` entries with the same key stay apart.
    fn digest_input(&self) -> BTreeMap<String, Vec<u8>>;
}

impl ConfigObject for ConfigMap {
    const CONFIG_KIND: ConfigKind = ConfigKind::ConfigMap;

    fn digest_input(&self) -> BTreeMap<String, Vec<u8>> {
        let mut input = BTreeMap::new();
        for (key, value) in self.data.iter().flatten() {
            input.insert(format!("data/{}", key), value.as_bytes().to_vec());
        }
        for (key, value) in self.binary_data.iter().flatten() {
            input.insert(format!("binaryData/{}", key), value.0.clone());
        }
        input
    }
}

impl ConfigObject for Secret {
    const CONFIG_KIND: ConfigKind = ConfigKind::Secret;

    fn digest_input(&self) -> BTreeMap<String, Vec<u8>> {
        let mut input = BTreeMap::new();
        for (key, value) in self.data.iter().flatten() {
            input.insert(format!("data/{}", key), value.0.clone());
        }
        for (key, value) in self.string_data.iter().flatten() {
            input.insert(format!("stringData/{}", key), value.as_bytes().to_vec());
        }
        input
    }
}
