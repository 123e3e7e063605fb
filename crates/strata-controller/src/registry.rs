use std::collections::HashMap;
use strata_core::{ConfigKind, GroupVersionKind, Resource, StatefulSet, WorkloadTemplate};

/// What a registered kind means to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindRole {
    /// The desired-state object being reconciled
    Template,
    /// A versioned instance the controller creates
    Instance,
    /// A configuration object pod specs can reference
    Config(ConfigKind),
}

/// Explicit mapping from GroupVersionKind to role, handed to the components
/// that need to classify store keys
#[derive(Debug, Clone)]
pub struct KindRegistry {
    roles: HashMap<GroupVersionKind, KindRole>,
}

impl KindRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    pub fn register(&mut self, gvk: GroupVersionKind, role: KindRole) -> &mut Self {
        self.roles.insert(gvk, role);
        self
    }

    pub fn role(&self, gvk: &GroupVersionKind) -> Option<KindRole> {
        self.roles.get(gvk).copied()
    }

    /// The configuration kind for `gvk`, if it is one
    pub fn config_kind(&self, gvk: &GroupVersionKind) -> Option<ConfigKind> {
        match self.role(gvk)? {
            KindRole::Config(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_template(&self, gvk: &GroupVersionKind) -> bool {
        self.role(gvk) == Some(KindRole::Template)
    }
}

impl Default for KindRegistry {
    /// WorkloadTemplate, StatefulSet, ConfigMap and Secret
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(WorkloadTemplate::type_gvk(), KindRole::Template)
            .register(StatefulSet::type_gvk(), KindRole::Instance)
            .register(
                ConfigKind::ConfigMap.gvk(),
                KindRole::Config(ConfigKind::ConfigMap),
            )
            .register(ConfigKind::Secret.gvk(), KindRole::Config(ConfigKind::Secret));
        registry
    }
}
