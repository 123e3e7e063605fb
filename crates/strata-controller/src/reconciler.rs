//! The reconcile algorithm.
//!
//! A template is turned into an append-only series of versions. Each version
//! is one StatefulSet per zone (or one when unsharded), created once and never
//! rewritten. A new version is cut when the template's structure changes or,
//! with `updateOnConfigChange`, when the content of a referenced ConfigMap or
//! Secret changes.

use crate::hasher::{references, ContentHasher};
use crate::owner::{controller_ref, OwnershipManager};
use crate::registry::KindRegistry;
use crate::zones::ZoneSharder;
use crate::{
    ControllerError, Result, ANNOTATION_CONFIG_SHA, ANNOTATION_TEMPLATE_SHA, ANNOTATION_VERSION,
    LABEL_AZ_INDEX,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use strata_core::{
    ConfigMap, ConfigObject, ConfigRef, PodSpec, Resource, Secret, StatefulSet, WorkloadTemplate,
};
use strata_storage::{
    create_resources, get_resource, list_resources, update_resource, ResourceStore, StorageError,
};
use tracing::{debug, info, warn};

/// Identity of a template to reconcile
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileRequest {
    pub namespace: String,
    pub name: String,
}

impl ReconcileRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_template(template: &WorkloadTemplate) -> Self {
        Self::new(template.namespace(), template.name())
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What a reconcile did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The template no longer exists; nothing was touched
    TemplateMissing,
    /// The latest version is current
    Unchanged { version: u64 },
    /// A new version was cut; `shards` are the instance names, in zone order
    Created { version: u64, shards: Vec<String> },
}

/// A StatefulSet controlled by a template, with its parsed version
#[derive(Debug, Clone)]
pub struct VersionedInstance {
    pub version: u64,
    pub zone_index: Option<usize>,
    pub statefulset: StatefulSet,
}

impl VersionedInstance {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        annotation(&self.statefulset, key)
    }
}

fn annotation<'a>(sts: &'a StatefulSet, key: &str) -> Option<&'a str> {
    sts.metadata.annotations.as_ref()?.get(key).map(String::as_str)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateDigestInput<'a> {
    template: &'a StatefulSet,
    zones: &'a [String],
    zone_node_label: &'a str,
}

/// Structural digest of everything that shapes a version's instances
pub fn template_digest(template: &WorkloadTemplate) -> Result<String> {
    let input = TemplateDigestInput {
        template: &template.spec.template,
        zones: &template.spec.zones,
        zone_node_label: template.zone_node_label(),
    };
    let bytes = serde_json::to_vec(&input)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Every StatefulSet in the template's namespace whose controller reference
/// points at the template, ordered by version then zone index.
///
/// Instances with a missing or unparseable version annotation are skipped.
pub async fn discover_instances(
    store: &dyn ResourceStore,
    template: &WorkloadTemplate,
) -> Result<Vec<VersionedInstance>> {
    let Some(uid) = template.uid() else {
        return Ok(Vec::new());
    };

    let candidates: Vec<StatefulSet> = list_resources(store, Some(template.namespace())).await?;

    let mut instances = Vec::new();
    for sts in candidates {
        if controller_ref(&sts).map(|r| r.uid.as_str()) != Some(uid.as_str()) {
            continue;
        }

        let version = match annotation(&sts, ANNOTATION_VERSION).map(str::parse::<u64>) {
            Some(Ok(version)) if version > 0 => version,
            other => {
                warn!(
                    "Ignoring {}/{}: unusable {} annotation {:?}",
                    template.namespace(),
                    sts.name(),
                    ANNOTATION_VERSION,
                    other
                );
                continue;
            }
        };

        let zone_index = sts
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_AZ_INDEX))
            .and_then(|index| index.parse().ok());

        instances.push(VersionedInstance {
            version,
            zone_index,
            statefulset: sts,
        });
    }

    instances.sort_by_key(|i| (i.version, i.zone_index));
    Ok(instances)
}

/// Shards of one version, in zone order, and how many this pass created
#[derive(Default)]
struct ShardsWritten {
    names: Vec<String>,
    created: usize,
}

/// Desired hashes for the current template
struct DesiredState {
    template_sha: String,
    config_sha: Option<String>,
}

pub struct VersionedWorkloadReconciler {
    store: Arc<dyn ResourceStore>,
    hasher: ContentHasher,
    owners: OwnershipManager,
}

impl VersionedWorkloadReconciler {
    pub fn new(store: Arc<dyn ResourceStore>, registry: KindRegistry) -> Self {
        Self {
            hasher: ContentHasher::new(store.clone()),
            owners: OwnershipManager::new(registry),
            store,
        }
    }

    /// Bring the template's versions up to date
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileOutcome> {
        let template: Option<WorkloadTemplate> =
            get_resource(self.store.as_ref(), &request.namespace, &request.name).await?;
        let Some(template) = template else {
            debug!("Template {} not found, nothing to do", request);
            return Ok(ReconcileOutcome::TemplateMissing);
        };

        template
            .validate()
            .map_err(|e| ControllerError::invalid_spec(request.to_string(), e.to_string()))?;

        let pod_spec = template.pod_spec().cloned().unwrap_or_default();
        let desired = self.desired_state(&template, &pod_spec).await?;

        let instances = discover_instances(self.store.as_ref(), &template).await?;
        let current_version = instances.iter().map(|i| i.version).max().unwrap_or(0);
        let current: Vec<&VersionedInstance> = instances
            .iter()
            .filter(|i| i.version == current_version)
            .collect();

        let cut_reason = self.cut_reason(&template, &desired, current_version, &current);
        let cut = cut_reason.is_some();
        let version = match cut_reason {
            Some(reason) => {
                let next = current_version.checked_add(1).ok_or_else(|| {
                    ControllerError::invalid_spec(
                        request.to_string(),
                        format!("no version can follow existing version {}", current_version),
                    )
                })?;
                info!("Cutting version {} of {}: {}", next, request, reason);
                next
            }
            None => current_version,
        };

        let written = self.create_shards(&template, &desired, version).await?;

        self.sync_weak_owners(&template, &pod_spec).await?;

        if cut {
            return Ok(ReconcileOutcome::Created {
                version,
                shards: written.names,
            });
        }

        if written.created > 0 {
            info!(
                "Created {} missing shard(s) of {} version {}",
                written.created, request, version
            );
        }
        Ok(ReconcileOutcome::Unchanged { version })
    }

    async fn desired_state(
        &self,
        template: &WorkloadTemplate,
        pod_spec: &PodSpec,
    ) -> Result<DesiredState> {
        let template_sha = template_digest(template)?;
        let config_sha = if template.spec.update_on_config_change {
            Some(self.hasher.compute(pod_spec, template.namespace()).await?)
        } else {
            None
        };

        Ok(DesiredState {
            template_sha,
            config_sha,
        })
    }

    /// Why a new version is needed, if it is
    fn cut_reason(
        &self,
        template: &WorkloadTemplate,
        desired: &DesiredState,
        current_version: u64,
        current: &[&VersionedInstance],
    ) -> Option<&'static str> {
        if current_version == 0 {
            return Some("no version exists");
        }

        let template_changed = current
            .iter()
            .any(|i| i.annotation(ANNOTATION_TEMPLATE_SHA) != Some(desired.template_sha.as_str()));
        if template_changed {
            return Some("template changed");
        }

        if template.spec.update_on_config_change {
            let config_changed = current
                .iter()
                .any(|i| i.annotation(ANNOTATION_CONFIG_SHA) != desired.config_sha.as_deref());
            if config_changed {
                return Some("referenced configuration changed");
            }
        }

        None
    }

    /// Create every shard of `version` that does not exist yet.
    ///
    /// The missing shards are written in one store transaction, so a failed
    /// pass leaves no partial version behind.
    async fn create_shards(
        &self,
        template: &WorkloadTemplate,
        desired: &DesiredState,
        version: u64,
    ) -> Result<ShardsWritten> {
        let mut written = ShardsWritten::default();
        let mut missing = Vec::new();

        for mut sts in ZoneSharder::shard(template, version)? {
            let annotations = sts.metadata.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(
                ANNOTATION_TEMPLATE_SHA.to_string(),
                desired.template_sha.clone(),
            );
            if let Some(config_sha) = &desired.config_sha {
                annotations.insert(ANNOTATION_CONFIG_SHA.to_string(), config_sha.clone());
            }

            self.owners.attach_controller_owner(&mut sts, template)?;

            let name = sts.name().to_string();
            let existing: Option<StatefulSet> =
                get_resource(self.store.as_ref(), template.namespace(), &name).await?;
            if existing.is_some() {
                debug!("Instance {}/{} already exists", template.namespace(), name);
            } else {
                missing.push(sts);
            }
            written.names.push(name);
        }

        if missing.is_empty() {
            return Ok(written);
        }

        match create_resources(self.store.as_ref(), missing).await {
            Ok(created) => {
                for sts in &created {
                    debug!("Created instance {}/{}", template.namespace(), sts.name());
                }
                written.created = created.len();
                Ok(written)
            }
            // Another writer created a shard since the check above
            Err(StorageError::AlreadyExists { key }) => Err(ControllerError::conflict(key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Weak owner references from the template to exactly the config objects
    /// it references, or to none when `updateOnConfigChange` is off
    async fn sync_weak_owners(
        &self,
        template: &WorkloadTemplate,
        pod_spec: &PodSpec,
    ) -> Result<()> {
        let wanted = if template.spec.update_on_config_change {
            references(pod_spec, template.namespace())
        } else {
            BTreeSet::new()
        };

        self.sync_weak_owners_of::<ConfigMap>(template, &wanted).await?;
        self.sync_weak_owners_of::<Secret>(template, &wanted).await
    }

    async fn sync_weak_owners_of<T: ConfigObject>(
        &self,
        template: &WorkloadTemplate,
        wanted: &BTreeSet<ConfigRef>,
    ) -> Result<()> {
        let objects: Vec<T> =
            list_resources(self.store.as_ref(), Some(template.namespace())).await?;

        for mut object in objects {
            let changed = if wanted.contains(&object.config_ref()) {
                self.owners.attach_weak_owner(&mut object, template)?
            } else {
                self.owners.remove_weak_owner(&mut object, template)
            };

            if changed {
                debug!(
                    "Updating weak owner of {} for template {}/{}",
                    object.config_ref(),
                    template.namespace(),
                    template.name()
                );
                update_resource(self.store.as_ref(), object).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        config_map, make_store, secret, shard_names, template, with_env_from, FailingStore,
    };
    use strata_core::ConfigKind;
    use strata_storage::create_resource;

    fn reconciler(store: &Arc<dyn ResourceStore>) -> VersionedWorkloadReconciler {
        VersionedWorkloadReconciler::new(store.clone(), KindRegistry::default())
    }

    async fn stored_template(
        store: &Arc<dyn ResourceStore>,
        template: WorkloadTemplate,
    ) -> WorkloadTemplate {
        create_resource(store.as_ref(), template).await.unwrap()
    }

    async fn instances(store: &Arc<dyn ResourceStore>, name: &str) -> Vec<VersionedInstance> {
        let template: WorkloadTemplate = get_resource(store.as_ref(), "default", name)
            .await
            .unwrap()
            .unwrap();
        discover_instances(store.as_ref(), &template).await.unwrap()
    }

    #[tokio::test]
    async fn test_unsharded_default() {
        let (_dir, store) = make_store();
        let foo = stored_template(&store, template("foo", &[])).await;

        let outcome = reconciler(&store)
            .reconcile(&ReconcileRequest::for_template(&foo))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Created {
                version: 1,
                shards: vec!["foo-v1".to_string()],
            }
        );

        let sts: StatefulSet = get_resource(store.as_ref(), "default", "foo-v1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(annotation(&sts, ANNOTATION_VERSION), Some("1"));
        assert_eq!(annotation(&sts, crate::ANNOTATION_ZONES), Some("[]"));
        assert!(annotation(&sts, ANNOTATION_TEMPLATE_SHA).is_some());
        assert!(annotation(&sts, ANNOTATION_CONFIG_SHA).is_none());

        let owner = controller_ref(&sts).unwrap();
        assert_eq!(owner.uid, foo.uid().unwrap());
        assert_eq!(owner.kind, "WorkloadTemplate");
    }

    #[tokio::test]
    async fn test_zone_fan_out() {
        let (_dir, store) = make_store();
        let foo = stored_template(&store, template("foo", &["z1", "z2", "z3"])).await;

        let outcome = reconciler(&store)
            .reconcile(&ReconcileRequest::for_template(&foo))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Created {
                version: 1,
                shards: shard_names(&["foo-z0-v1", "foo-z1-v1", "foo-z2-v1"]),
            }
        );

        let found = instances(&store, "foo").await;
        assert_eq!(found.len(), 3);
        let hashes: BTreeSet<_> = found
            .iter()
            .map(|i| i.annotation(ANNOTATION_TEMPLATE_SHA).unwrap().to_string())
            .collect();
        assert_eq!(hashes.len(), 1);
        for (index, instance) in found.iter().enumerate() {
            assert_eq!(instance.zone_index, Some(index));
            assert_eq!(
                instance.annotation(crate::ANNOTATION_ZONES),
                Some(r#"["z1","z2","z3"]"#)
            );
        }
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (_dir, store) = make_store();
        let foo = stored_template(&store, template("foo", &["z1", "z2"])).await;
        let reconciler = reconciler(&store);
        let request = ReconcileRequest::for_template(&foo);

        reconciler.reconcile(&request).await.unwrap();
        let before: Vec<_> = instances(&store, "foo")
            .await
            .into_iter()
            .map(|i| i.statefulset.metadata.resource_version)
            .collect();

        let outcome = reconciler.reconcile(&request).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged { version: 1 });

        let after: Vec<_> = instances(&store, "foo")
            .await
            .into_iter()
            .map(|i| i.statefulset.metadata.resource_version)
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_template_change_cuts_new_version_and_keeps_old() {
        let (_dir, store) = make_store();
        let foo = stored_template(&store, template("foo", &[])).await;
        let reconciler = reconciler(&store);
        let request = ReconcileRequest::for_template(&foo);
        reconciler.reconcile(&request).await.unwrap();

        let mut changed: WorkloadTemplate = get_resource(store.as_ref(), "default", "foo")
            .await
            .unwrap()
            .unwrap();
        changed
            .spec
            .template
            .spec
            .as_mut()
            .unwrap()
            .replicas = Some(5);
        update_resource(store.as_ref(), changed).await.unwrap();

        let outcome = reconciler.reconcile(&request).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Created {
                version: 2,
                shards: shard_names(&["foo-v2"]),
            }
        );

        let versions: Vec<_> = instances(&store, "foo").await.iter().map(|i| i.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_legacy_versions_without_hashes_cut_next_version() {
        let (_dir, store) = make_store();
        let foo = stored_template(&store, template("foo", &[])).await;
        let owners = OwnershipManager::new(KindRegistry::default());

        for version in [1, 2] {
            let mut sts = ZoneSharder::shard(&foo, version).unwrap().remove(0);
            owners.attach_controller_owner(&mut sts, &foo).unwrap();
            create_resource(store.as_ref(), sts).await.unwrap();
        }

        let outcome = reconciler(&store)
            .reconcile(&ReconcileRequest::for_template(&foo))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Created {
                version: 3,
                shards: shard_names(&["foo-v3"]),
            }
        );
    }

    #[tokio::test]
    async fn test_config_change_gated_by_flag() {
        for update_on_config_change in [true, false] {
            let (_dir, store) = make_store();
            let settings = create_resource(store.as_ref(), config_map("example1", "a"))
                .await
                .unwrap();

            let mut foo = with_env_from(template("foo", &[]), ConfigKind::ConfigMap, "example1");
            foo.spec.update_on_config_change = update_on_config_change;
            let foo = stored_template(&store, foo).await;
            let reconciler = reconciler(&store);
            let request = ReconcileRequest::for_template(&foo);
            reconciler.reconcile(&request).await.unwrap();
            let v1_before = instances(&store, "foo").await.remove(0).statefulset;

            let mut changed: ConfigMap = get_resource(store.as_ref(), "default", "example1")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(changed.metadata.uid, settings.metadata.uid);
            changed.data = Some(BTreeMap::from([("key".to_string(), "b".to_string())]));
            update_resource(store.as_ref(), changed).await.unwrap();

            let outcome = reconciler.reconcile(&request).await.unwrap();
            if update_on_config_change {
                assert_eq!(
                    outcome,
                    ReconcileOutcome::Created {
                        version: 2,
                        shards: shard_names(&["foo-v2"]),
                    }
                );
                let latest = instances(&store, "foo").await.pop().unwrap();
                assert!(latest.annotation(ANNOTATION_CONFIG_SHA).is_some());
            } else {
                assert_eq!(outcome, ReconcileOutcome::Unchanged { version: 1 });
            }

            // v1 is never rewritten, whether or not a version was cut
            let v1_after: StatefulSet = get_resource(store.as_ref(), "default", "foo-v1")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                v1_after.metadata.resource_version,
                v1_before.metadata.resource_version
            );
            assert_eq!(v1_after, v1_before);
        }
    }

    #[tokio::test]
    async fn test_weak_owner_only_with_flag() {
        for update_on_config_change in [true, false] {
            let (_dir, store) = make_store();
            create_resource(store.as_ref(), secret("example1", "s3cret"))
                .await
                .unwrap();

            let mut foo = with_env_from(template("foo", &[]), ConfigKind::Secret, "example1");
            foo.spec.update_on_config_change = update_on_config_change;
            let foo = stored_template(&store, foo).await;
            reconciler(&store)
                .reconcile(&ReconcileRequest::for_template(&foo))
                .await
                .unwrap();

            let stored: Secret = get_resource(store.as_ref(), "default", "example1")
                .await
                .unwrap()
                .unwrap();
            let owners = OwnershipManager::new(KindRegistry::default());
            assert_eq!(owners.has_weak_owner(&stored, &foo), update_on_config_change);
            if update_on_config_change {
                let reference = &stored.metadata.owner_references.as_ref().unwrap()[0];
                assert_eq!(reference.controller, Some(false));
                assert_eq!(reference.block_owner_deletion, Some(true));
            }
        }
    }

    #[tokio::test]
    async fn test_removed_reference_cuts_version_and_drops_weak_owner() {
        let (_dir, store) = make_store();
        create_resource(store.as_ref(), config_map("example1", "a"))
            .await
            .unwrap();
        create_resource(store.as_ref(), config_map("example2", "b"))
            .await
            .unwrap();

        let mut foo = with_env_from(template("foo", &[]), ConfigKind::ConfigMap, "example1");
        let pod_spec = foo
            .spec
            .template
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap();
        let mut container2 = pod_spec.containers[0].clone();
        container2.name = "container2".to_string();
        container2.env_from.as_mut().unwrap()[0]
            .config_map_ref
            .as_mut()
            .unwrap()
            .name = "example2".to_string();
        pod_spec.containers.push(container2);
        foo.spec.update_on_config_change = true;
        let foo = stored_template(&store, foo).await;

        let reconciler = reconciler(&store);
        let request = ReconcileRequest::for_template(&foo);
        reconciler.reconcile(&request).await.unwrap();

        let example2: ConfigMap = get_resource(store.as_ref(), "default", "example2")
            .await
            .unwrap()
            .unwrap();
        let owners = OwnershipManager::new(KindRegistry::default());
        assert!(owners.has_weak_owner(&example2, &foo));

        let mut edited: WorkloadTemplate = get_resource(store.as_ref(), "default", "foo")
            .await
            .unwrap()
            .unwrap();
        edited
            .spec
            .template
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers
            .retain(|c| c.name != "container2");
        update_resource(store.as_ref(), edited).await.unwrap();

        let outcome = reconciler.reconcile(&request).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Created {
                version: 2,
                shards: shard_names(&["foo-v2"]),
            }
        );

        let example1: ConfigMap = get_resource(store.as_ref(), "default", "example1")
            .await
            .unwrap()
            .unwrap();
        let example2: ConfigMap = get_resource(store.as_ref(), "default", "example2")
            .await
            .unwrap()
            .unwrap();
        assert!(owners.has_weak_owner(&example1, &foo));
        assert!(!owners.has_weak_owner(&example2, &foo));
    }

    #[tokio::test]
    async fn test_missing_template_is_success() {
        let (_dir, store) = make_store();
        let outcome = reconciler(&store)
            .reconcile(&ReconcileRequest::new("default", "foo"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::TemplateMissing);

        let all: Vec<StatefulSet> = list_resources(store.as_ref(), None).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_missing_reference_is_retryable() {
        let (_dir, store) = make_store();
        let mut foo = with_env_from(template("foo", &[]), ConfigKind::ConfigMap, "absent");
        foo.spec.update_on_config_change = true;
        let foo = stored_template(&store, foo).await;

        let err = reconciler(&store)
            .reconcile(&ReconcileRequest::for_template(&foo))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ReferenceUnresolved { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_transient_store_error_is_returned() {
        let (_dir, inner) = make_store();
        let foo = stored_template(&inner, template("foo", &[])).await;

        let failing = FailingStore::new(inner.clone());
        failing.fail_gets_of("WorkloadTemplate");
        let store: Arc<dyn ResourceStore> = Arc::new(failing);

        let err = reconciler(&store)
            .reconcile(&ReconcileRequest::for_template(&foo))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::TransientStore { .. }));
        assert!(err.is_retryable());

        let all: Vec<StatefulSet> = list_resources(inner.as_ref(), None).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_failed_shard_write_leaves_no_partial_version() {
        let (_dir, inner) = make_store();
        let foo = stored_template(&inner, template("foo", &["z1", "z2", "z3"])).await;

        let failing = Arc::new(FailingStore::new(inner.clone()));
        failing.fail_creates_of("foo-z1-v1");
        let store: Arc<dyn ResourceStore> = failing.clone();
        let reconciler = reconciler(&store);
        let request = ReconcileRequest::for_template(&foo);

        let err = reconciler.reconcile(&request).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(instances(&inner, "foo").await.is_empty());

        failing.clear();
        let outcome = reconciler.reconcile(&request).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Created {
                version: 1,
                shards: shard_names(&["foo-z0-v1", "foo-z1-v1", "foo-z2-v1"]),
            }
        );
    }

    #[tokio::test]
    async fn test_template_change_after_failed_write_keeps_versions_whole() {
        let (_dir, inner) = make_store();
        let foo = stored_template(&inner, template("foo", &["z1", "z2", "z3"])).await;

        let failing = Arc::new(FailingStore::new(inner.clone()));
        failing.fail_creates_of("foo-z1-v1");
        let store: Arc<dyn ResourceStore> = failing.clone();
        let reconciler = reconciler(&store);
        let request = ReconcileRequest::for_template(&foo);
        assert!(reconciler.reconcile(&request).await.is_err());

        let mut changed: WorkloadTemplate = get_resource(inner.as_ref(), "default", "foo")
            .await
            .unwrap()
            .unwrap();
        changed.spec.template.spec.as_mut().unwrap().replicas = Some(7);
        update_resource(inner.as_ref(), changed).await.unwrap();

        failing.clear();
        reconciler.reconcile(&request).await.unwrap();
        let outcome = reconciler.reconcile(&request).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged { version: 1 });

        let found = instances(&inner, "foo").await;
        let names: Vec<_> = found.iter().map(|i| i.statefulset.name().to_string()).collect();
        assert_eq!(names, shard_names(&["foo-z0-v1", "foo-z1-v1", "foo-z2-v1"]));
        assert!(found
            .iter()
            .all(|i| i.statefulset.spec.as_ref().unwrap().replicas == Some(7)));
    }

    #[tokio::test]
    async fn test_incomplete_current_version_is_completed() {
        let (_dir, store) = make_store();
        let foo = stored_template(&store, template("foo", &["z1", "z2", "z3"])).await;
        let reconciler = reconciler(&store);
        let request = ReconcileRequest::for_template(&foo);

        // Only the first shard of v1 survives
        let desired = reconciler
            .desired_state(&foo, foo.pod_spec().unwrap())
            .await
            .unwrap();
        let mut shards = ZoneSharder::shard(&foo, 1).unwrap();
        let mut first = shards.remove(0);
        first.metadata.annotations.as_mut().unwrap().insert(
            ANNOTATION_TEMPLATE_SHA.to_string(),
            desired.template_sha.clone(),
        );
        OwnershipManager::new(KindRegistry::default())
            .attach_controller_owner(&mut first, &foo)
            .unwrap();
        create_resource(store.as_ref(), first).await.unwrap();

        let outcome = reconciler.reconcile(&request).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged { version: 1 });

        let found = instances(&store, "foo").await;
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|i| i.version == 1));
    }

    #[tokio::test]
    async fn test_largest_version_does_not_overflow() {
        let (_dir, store) = make_store();
        let foo = stored_template(&store, template("foo", &[])).await;

        let mut sts = ZoneSharder::shard(&foo, u64::MAX).unwrap().remove(0);
        OwnershipManager::new(KindRegistry::default())
            .attach_controller_owner(&mut sts, &foo)
            .unwrap();
        create_resource(store.as_ref(), sts).await.unwrap();

        let err = reconciler(&store)
            .reconcile(&ReconcileRequest::for_template(&foo))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSpec { .. }));
        assert!(!err.is_retryable());

        let versions: Vec<_> = instances(&store, "foo").await.iter().map(|i| i.version).collect();
        assert_eq!(versions, vec![u64::MAX]);
    }

    #[tokio::test]
    async fn test_template_without_namespace_is_rejected() {
        let (_dir, store) = make_store();
        let mut foo = template("foo", &[]);
        foo.metadata.namespace = None;
        create_resource(store.as_ref(), foo).await.unwrap();

        let err = reconciler(&store)
            .reconcile(&ReconcileRequest::new("", "foo"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSpec { .. }));
        assert!(!err.is_retryable());

        let all: Vec<StatefulSet> = list_resources(store.as_ref(), None).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_zones_not_retryable() {
        let (_dir, store) = make_store();
        let foo = stored_template(&store, template("foo", &["z1", "z1"])).await;

        let err = reconciler(&store)
            .reconcile(&ReconcileRequest::for_template(&foo))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidSpec { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_template_digest_tracks_structure() {
        let base = template("foo", &["z1"]);
        let digest = template_digest(&base).unwrap();
        assert_eq!(digest, template_digest(&base.clone()).unwrap());

        let mut relabeled = base.clone();
        relabeled.spec.zone_node_label = Some("rack".to_string());
        assert_ne!(digest, template_digest(&relabeled).unwrap());

        let mut rezoned = base.clone();
        rezoned.spec.zones.push("z2".to_string());
        assert_ne!(digest, template_digest(&rezoned).unwrap());

        // The flag alone does not change instance structure
        let mut flagged = base;
        flagged.spec.update_on_config_change = true;
        assert_eq!(digest, template_digest(&flagged).unwrap());
    }
}
