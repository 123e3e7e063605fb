//! Content hashing of the configuration a pod spec consumes.
//!
//! The reference surface of a pod spec is every ConfigMap and Secret named by
//! `env[].valueFrom`, `envFrom[]` or a (projected) volume, across containers
//! and init containers. The digest covers the referenced objects' data, not
//! the pod spec itself.

use crate::{ControllerError, Result};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strata_core::{ConfigKind, ConfigMap, ConfigObject, ConfigRef, Secret};
use strata_storage::{get_resource, ResourceStore};
use tracing::debug;

/// Every configuration object `pod_spec` references, resolved in `namespace`
pub fn references(pod_spec: &PodSpec, namespace: &str) -> BTreeSet<ConfigRef> {
    let mut refs = BTreeSet::new();
    let mut add = |kind: ConfigKind, name: &str| {
        if !name.is_empty() {
            refs.insert(ConfigRef::new(kind, namespace, name));
        }
    };

    let containers = pod_spec
        .containers
        .iter()
        .chain(pod_spec.init_containers.iter().flatten());
    for container in containers {
        container_references(container, &mut add);
    }

    for volume in pod_spec.volumes.iter().flatten() {
        if let Some(cm) = &volume.config_map {
            add(ConfigKind::ConfigMap, &cm.name);
        }
        if let Some(secret) = &volume.secret {
            add(ConfigKind::Secret, secret.secret_name.as_deref().unwrap_or_default());
        }
        let sources = volume.projected.as_ref().and_then(|p| p.sources.as_ref());
        for source in sources.into_iter().flatten() {
            if let Some(cm) = &source.config_map {
                add(ConfigKind::ConfigMap, &cm.name);
            }
            if let Some(secret) = &source.secret {
                add(ConfigKind::Secret, &secret.name);
            }
        }
    }

    refs
}

fn container_references(container: &Container, add: &mut impl FnMut(ConfigKind, &str)) {
    for env in container.env.iter().flatten() {
        let Some(source) = &env.value_from else {
            continue;
        };
        if let Some(selector) = &source.config_map_key_ref {
            add(ConfigKind::ConfigMap, &selector.name);
        }
        if let Some(selector) = &source.secret_key_ref {
            add(ConfigKind::Secret, &selector.name);
        }
    }

    for env_from in container.env_from.iter().flatten() {
        if let Some(cm) = &env_from.config_map_ref {
            add(ConfigKind::ConfigMap, &cm.name);
        }
        if let Some(secret) = &env_from.secret_ref {
            add(ConfigKind::Secret, &secret.name);
        }
    }
}

/// Digest a sorted sequence of `(reference, data)` pairs
///
/// Each pair contributes `kind/namespace/name`, a NUL, the canonical JSON of
/// its data (keys sorted, values hex-encoded) and another NUL.
pub fn digest<'a>(
    entries: impl IntoIterator<Item = (&'a ConfigRef, &'a BTreeMap<String, Vec<u8>>)>,
) -> Result<String> {
    let mut hasher = Sha256::new();
    for (reference, data) in entries {
        let canonical: BTreeMap<&str, String> = data
            .iter()
            .map(|(key, value)| (key.as_str(), hex::encode(value)))
            .collect();

        hasher.update(reference.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(&canonical)?);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the content hash of a pod spec's configuration
pub struct ContentHasher {
    store: Arc<dyn ResourceStore>,
}

impl ContentHasher {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// SHA-256 (lowercase hex) over every referenced object's data.
    ///
    /// Fails with `ReferenceUnresolved` if any referenced object is missing.
    pub async fn compute(&self, pod_spec: &PodSpec, namespace: &str) -> Result<String> {
        let refs = references(pod_spec, namespace);

        let mut entries = Vec::with_capacity(refs.len());
        for reference in &refs {
            let data = self
                .fetch(reference)
                .await?
                .ok_or_else(|| ControllerError::reference_unresolved(reference))?;
            entries.push((reference, data));
        }

        let hash = digest(entries.iter().map(|(r, d)| (*r, d)))?;
        debug!("Content hash over {} references: {}", refs.len(), hash);
        Ok(hash)
    }

    async fn fetch(&self, reference: &ConfigRef) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let store = self.store.as_ref();
        let data = match reference.kind {
            ConfigKind::ConfigMap => {
                get_resource::<ConfigMap, _>(store, &reference.namespace, &reference.name)
                    .await?
                    .map(|cm| cm.digest_input())
            }
            ConfigKind::Secret => {
                get_resource::<Secret, _>(store, &reference.namespace, &reference.name)
                    .await?
                    .map(|secret| secret.digest_input())
            }
        };
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMapEnvSource, ConfigMapKeySelector, ConfigMapProjection, ConfigMapVolumeSource,
        EnvFromSource, EnvVar, EnvVarSource, ProjectedVolumeSource, SecretKeySelector,
        SecretProjection, SecretVolumeSource, Volume, VolumeProjection,
    };
    use strata_storage::{create_resource, update_resource, KvResourceStore, RedbBackend};
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, Arc<dyn ResourceStore>) {
        let dir = tempdir().unwrap();
        let backend = Arc::new(RedbBackend::new(dir.path().join("test.redb")).unwrap());
        (dir, Arc::new(KvResourceStore::new(backend)))
    }

    fn config_map(name: &str, value: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm.metadata.namespace = Some("default".to_string());
        cm.data = Some(BTreeMap::from([("key".to_string(), value.to_string())]));
        cm
    }

    fn env_from_config_map(name: &str) -> Container {
        Container {
            name: "app".to_string(),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: name.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_references_cover_every_source() {
        let app = Container {
            name: "app".to_string(),
            env: Some(vec![
                EnvVar {
                    name: "A".to_string(),
                    value_from: Some(EnvVarSource {
                        config_map_key_ref: Some(ConfigMapKeySelector {
                            name: "env-cm".to_string(),
                            key: "a".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                EnvVar {
                    name: "B".to_string(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: "env-secret".to_string(),
                            key: "b".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                EnvVar {
                    name: "PLAIN".to_string(),
                    value: Some("x".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let init = env_from_config_map("init-cm");

        let pod_spec = PodSpec {
            containers: vec![app],
            init_containers: Some(vec![init]),
            volumes: Some(vec![
                Volume {
                    name: "v1".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: "vol-cm".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "v2".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some("vol-secret".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "v3".to_string(),
                    projected: Some(ProjectedVolumeSource {
                        sources: Some(vec![
                            VolumeProjection {
                                config_map: Some(ConfigMapProjection {
                                    name: "proj-cm".to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            VolumeProjection {
                                secret: Some(SecretProjection {
                                    name: "proj-secret".to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let refs: Vec<_> = references(&pod_spec, "default").into_iter().collect();
        assert_eq!(
            refs,
            vec![
                ConfigRef::config_map("default", "env-cm"),
                ConfigRef::config_map("default", "init-cm"),
                ConfigRef::config_map("default", "proj-cm"),
                ConfigRef::config_map("default", "vol-cm"),
                ConfigRef::secret("default", "env-secret"),
                ConfigRef::secret("default", "proj-secret"),
                ConfigRef::secret("default", "vol-secret"),
            ]
        );
    }

    #[test]
    fn test_references_deduplicated() {
        let pod_spec = PodSpec {
            containers: vec![env_from_config_map("shared"), env_from_config_map("shared")],
            ..Default::default()
        };
        assert_eq!(references(&pod_spec, "default").len(), 1);
    }

    #[test]
    fn test_digest_distinguishes_data_and_identity() {
        let a = ConfigRef::config_map("default", "a");
        let b = ConfigRef::config_map("default", "b");
        let one = BTreeMap::from([("data/k".to_string(), b"1".to_vec())]);
        let two = BTreeMap::from([("data/k".to_string(), b"2".to_vec())]);

        let base = digest([(&a, &one)]).unwrap();
        assert_eq!(base, digest([(&a, &one)]).unwrap());
        assert_eq!(base.len(), 64);
        assert_ne!(base, digest([(&a, &two)]).unwrap());
        assert_ne!(base, digest([(&b, &one)]).unwrap());
    }

    #[tokio::test]
    async fn test_compute_tracks_config_changes() {
        let (_dir, store) = make_store();
        let created = create_resource(store.as_ref(), config_map("settings", "v1"))
            .await
            .unwrap();

        let hasher = ContentHasher::new(store.clone());
        let pod_spec = PodSpec {
            containers: vec![env_from_config_map("settings")],
            ..Default::default()
        };

        let first = hasher.compute(&pod_spec, "default").await.unwrap();
        assert_eq!(first, hasher.compute(&pod_spec, "default").await.unwrap());

        let mut changed = created;
        changed.data = Some(BTreeMap::from([("key".to_string(), "v2".to_string())]));
        update_resource(store.as_ref(), changed).await.unwrap();

        let second = hasher.compute(&pod_spec, "default").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_compute_without_references_is_stable() {
        let (_dir, store) = make_store();
        let hasher = ContentHasher::new(store);
        let pod_spec = PodSpec::default();

        let hash = hasher.compute(&pod_spec, "default").await.unwrap();
        assert_eq!(hash, hex::encode(Sha256::digest(b"")));
    }

    #[tokio::test]
    async fn test_compute_missing_reference() {
        let (_dir, store) = make_store();
        let hasher = ContentHasher::new(store);
        let pod_spec = PodSpec {
            containers: vec![env_from_config_map("absent")],
            ..Default::default()
        };

        let result = hasher.compute(&pod_spec, "default").await;
        assert!(matches!(
            result,
            Err(ControllerError::ReferenceUnresolved { .. })
        ));
    }
}
