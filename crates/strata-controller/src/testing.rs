//! Fixtures shared by the controller tests

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSetSpec;
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, Container, EnvFromSource, PodSpec, PodTemplateSpec, SecretEnvSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    ConfigKind, ConfigMap, GroupVersionKind, ResourceEvent, ResourceKey, Secret, StatefulSet,
    WorkloadTemplate, WorkloadTemplateSpec,
};
use strata_storage::{KvResourceStore, RedbBackend, ResourceStore, StorageError};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub fn make_store() -> (TempDir, Arc<dyn ResourceStore>) {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
    (dir, Arc::new(KvResourceStore::new(backend)))
}

/// Template `default/<name>` with one container and the given zones
pub fn template(name: &str, zones: &[&str]) -> WorkloadTemplate {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);

    let mut source = StatefulSet::default();
    source.metadata.labels = Some(labels.clone());
    source.spec = Some(StatefulSetSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(strata_core::ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "container1".to_string(),
                    image: Some("busybox".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    });

    WorkloadTemplate::new(
        "default",
        name,
        WorkloadTemplateSpec {
            template: source,
            zones: zones.iter().map(|z| z.to_string()).collect(),
            ..Default::default()
        },
    )
}

/// Add an `envFrom` reference to the first container
pub fn with_env_from(
    mut template: WorkloadTemplate,
    kind: ConfigKind,
    name: &str,
) -> WorkloadTemplate {
    let source = match kind {
        ConfigKind::ConfigMap => EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        ConfigKind::Secret => EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    };

    let container = template
        .spec
        .template
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .map(|pod| &mut pod.containers[0])
        .unwrap();
    container.env_from.get_or_insert_with(Vec::new).push(source);
    template
}

pub fn config_map(name: &str, value: &str) -> ConfigMap {
    let mut cm = ConfigMap::default();
    cm.metadata.name = Some(name.to_string());
    cm.metadata.namespace = Some("default".to_string());
    cm.data = Some(BTreeMap::from([("key".to_string(), value.to_string())]));
    cm
}

pub fn secret(name: &str, value: &str) -> Secret {
    let mut secret = Secret::default();
    secret.metadata.name = Some(name.to_string());
    secret.metadata.namespace = Some("default".to_string());
    secret.string_data = Some(BTreeMap::from([("password".to_string(), value.to_string())]));
    secret
}

pub fn shard_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[derive(Default)]
struct Faults {
    get_kind: Option<String>,
    create_name: Option<String>,
    get_delay: Option<Duration>,
}

/// Store wrapper that answers selected calls with `Unavailable`
pub struct FailingStore {
    inner: Arc<dyn ResourceStore>,
    faults: Mutex<Faults>,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn ResourceStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fail every get of objects of `kind`
    pub fn fail_gets_of(&self, kind: &str) {
        self.faults.lock().get_kind = Some(kind.to_string());
    }

    /// Fail creation of the object named `name`, and of any batch holding it
    pub fn fail_creates_of(&self, name: &str) {
        self.faults.lock().create_name = Some(name.to_string());
    }

    /// Stall every get for `delay` before answering
    pub fn delay_gets(&self, delay: Duration) {
        self.faults.lock().get_delay = Some(delay);
    }

    pub fn clear(&self) {
        *self.faults.lock() = Faults::default();
    }
}

#[async_trait]
impl ResourceStore for FailingStore {
    async fn get_object(&self, key: &ResourceKey) -> strata_storage::Result<Option<Value>> {
        let delay = {
            let faults = self.faults.lock();
            if faults.get_kind.as_deref() == Some(key.gvk.kind.as_str()) {
                return Err(StorageError::unavailable("injected get failure"));
            }
            faults.get_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.get_object(key).await
    }

    async fn list_objects(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> strata_storage::Result<Vec<Value>> {
        self.inner.list_objects(gvk, namespace).await
    }

    async fn create_object(
        &self,
        key: &ResourceKey,
        object: Value,
    ) -> strata_storage::Result<Value> {
        if self.faults.lock().create_name.as_deref() == Some(key.name.as_str()) {
            return Err(StorageError::unavailable("injected create failure"));
        }
        self.inner.create_object(key, object).await
    }

    async fn create_objects(
        &self,
        objects: Vec<(ResourceKey, Value)>,
    ) -> strata_storage::Result<Vec<Value>> {
        let failing = self.faults.lock().create_name.clone();
        if objects.iter().any(|(key, _)| Some(&key.name) == failing.as_ref()) {
            return Err(StorageError::unavailable("injected create failure"));
        }
        self.inner.create_objects(objects).await
    }

    async fn update_object(
        &self,
        key: &ResourceKey,
        object: Value,
    ) -> strata_storage::Result<Value> {
        self.inner.update_object(key, object).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.inner.subscribe()
    }
}
