//! Reverse lookup from a changed ConfigMap or Secret to the templates that
//! consume it.
//!
//! Nothing is cached: each query scans the templates of the object's
//! namespace and recomputes their reference sets, so the answer always
//! reflects the current template specs.

use crate::hasher::references;
use crate::reconciler::ReconcileRequest;
use crate::registry::KindRegistry;
use crate::Result;
use std::sync::Arc;
use strata_core::{ConfigRef, ResourceKey, WorkloadTemplate};
use strata_storage::{list_resources, ResourceStore};
use tracing::debug;

pub struct ReferenceIndex {
    store: Arc<dyn ResourceStore>,
    registry: KindRegistry,
}

impl ReferenceIndex {
    pub fn new(store: Arc<dyn ResourceStore>, registry: KindRegistry) -> Self {
        Self { store, registry }
    }

    /// Templates to re-reconcile because `changed` changed.
    ///
    /// Only templates with `updateOnConfigChange` set are returned. The
    /// result is sorted and free of duplicates.
    pub async fn resolve(&self, changed: &ConfigRef) -> Result<Vec<ReconcileRequest>> {
        let templates: Vec<WorkloadTemplate> =
            list_resources(self.store.as_ref(), Some(changed.namespace.as_str())).await?;

        let mut requests: Vec<ReconcileRequest> = templates
            .iter()
            .filter(|t| t.spec.update_on_config_change)
            .filter(|t| {
                t.pod_spec()
                    .map(|pod_spec| references(pod_spec, &changed.namespace).contains(changed))
                    .unwrap_or(false)
            })
            .map(ReconcileRequest::for_template)
            .collect();
        requests.sort();
        requests.dedup();

        debug!("{} resolved to {} template(s)", changed, requests.len());
        Ok(requests)
    }

    /// Like [`resolve`](Self::resolve) for an arbitrary store key; keys of
    /// non-configuration kinds resolve to nothing
    pub async fn resolve_event(&self, key: &ResourceKey) -> Result<Vec<ReconcileRequest>> {
        match self.registry.config_kind(&key.gvk) {
            Some(kind) => {
                self.resolve(&ConfigRef::new(kind, key.namespace.clone(), key.name.clone()))
                    .await
            }
            None => Ok(Vec::new()),
        }
    }
}
