//! Expansion of one template into its per-zone StatefulSets.

use crate::{
    ControllerError, Result, ANNOTATION_VERSION, ANNOTATION_ZONES, LABEL_AZ_INDEX, LABEL_AZ_NAME,
    LABEL_TEMPLATE_NAME,
};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PodSpec,
};
use std::collections::{BTreeMap, HashSet};
use strata_core::{is_valid_name, ObjectMeta, Resource, StatefulSet, WorkloadTemplate};

/// Env vars every container of a zoned shard receives, in injection order
pub const ZONE_ENV_VARS: [&str; 3] = ["KUBE_AZ", "BOSH_AZ", "STRATA_AZ"];
pub const AZ_INDEX_ENV: &str = "AZ_INDEX";
pub const REPLICAS_ENV: &str = "REPLICAS";

/// Name of the instance for `template`, optional zone index and version
pub fn instance_name(template: &str, zone_index: Option<usize>, version: u64) -> String {
    match zone_index {
        Some(index) => format!("{}-z{}-v{}", template, index, version),
        None => format!("{}-v{}", template, version),
    }
}

/// Splits a template into StatefulSets, one per zone (or one when unsharded)
pub struct ZoneSharder;

impl ZoneSharder {
    /// All shards of `version`, ordered by zone index.
    ///
    /// Every shard carries the template StatefulSet's labels and annotations
    /// plus the version and zones annotations. Zoned shards additionally get
    /// the zone labels, a required node affinity on the zone label and the
    /// zone env vars.
    pub fn shard(template: &WorkloadTemplate, version: u64) -> Result<Vec<StatefulSet>> {
        let id = template_id(template);
        Self::validate(template, &id)?;

        let zones_json = serde_json::to_string(&template.spec.zones)?;

        if !template.is_sharded() {
            let sts = Self::base_instance(template, &id, None, version, &zones_json)?;
            return Ok(vec![sts]);
        }

        let mut shards = Vec::with_capacity(template.spec.zones.len());
        for (index, zone) in template.spec.zones.iter().enumerate() {
            let mut sts = Self::base_instance(template, &id, Some(index), version, &zones_json)?;
            Self::apply_zone(&mut sts, template, &id, index, zone)?;
            shards.push(sts);
        }
        Ok(shards)
    }

    fn validate(template: &WorkloadTemplate, id: &str) -> Result<()> {
        if template.spec.template.spec.is_none() {
            return Err(ControllerError::invalid_spec(
                id,
                "spec.template.spec is required",
            ));
        }

        if template.zone_node_label().is_empty() {
            return Err(ControllerError::invalid_spec(id, "zoneNodeLabel is empty"));
        }

        let mut seen = HashSet::new();
        for zone in &template.spec.zones {
            if zone.is_empty() {
                return Err(ControllerError::invalid_spec(id, "zone names must not be empty"));
            }
            if !seen.insert(zone.as_str()) {
                return Err(ControllerError::invalid_spec(
                    id,
                    format!("zone '{}' is listed more than once", zone),
                ));
            }
        }

        Ok(())
    }

    fn base_instance(
        template: &WorkloadTemplate,
        id: &str,
        zone_index: Option<usize>,
        version: u64,
        zones_json: &str,
    ) -> Result<StatefulSet> {
        let name = instance_name(template.name(), zone_index, version);
        if !is_valid_name(&name) {
            return Err(ControllerError::invalid_spec(
                id,
                format!("generated instance name '{}' is not a valid name", name),
            ));
        }

        let source = &template.spec.template;

        let mut labels = source.metadata.labels.clone().unwrap_or_default();
        labels.insert(LABEL_TEMPLATE_NAME.to_string(), template.name().to_string());

        let mut annotations = source.metadata.annotations.clone().unwrap_or_default();
        annotations.insert(ANNOTATION_VERSION.to_string(), version.to_string());
        annotations.insert(ANNOTATION_ZONES.to_string(), zones_json.to_string());

        let mut spec = source.spec.clone().unwrap_or_default();
        let pod_meta = spec.template.metadata.get_or_insert_with(Default::default);
        pod_meta
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_ZONES.to_string(), zones_json.to_string());

        Ok(StatefulSet {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(template.namespace().to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        })
    }

    fn apply_zone(
        sts: &mut StatefulSet,
        template: &WorkloadTemplate,
        id: &str,
        index: usize,
        zone: &str,
    ) -> Result<()> {
        let zone_meta = [
            (LABEL_AZ_INDEX.to_string(), index.to_string()),
            (LABEL_AZ_NAME.to_string(), zone.to_string()),
        ];

        add_entries(&mut sts.metadata, &zone_meta);

        let spec = sts
            .spec
            .as_mut()
            .ok_or_else(|| ControllerError::internal_error("shard lost its spec"))?;

        let pod_meta = spec.template.metadata.get_or_insert_with(Default::default);
        add_entries(pod_meta, &zone_meta);

        // Keep shards of one version from selecting each other's pods
        spec.selector
            .match_labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_AZ_INDEX.to_string(), index.to_string());

        let pod_spec = spec.template.spec.get_or_insert_with(PodSpec::default);
        add_zone_affinity(pod_spec, template.zone_node_label(), zone)
            .map_err(|reason| ControllerError::invalid_spec(id, reason))?;

        let mut env = Vec::with_capacity(ZONE_ENV_VARS.len() + 2);
        for var in ZONE_ENV_VARS {
            env.push((var, zone.to_string()));
        }
        env.push((AZ_INDEX_ENV, (index + 1).to_string()));
        env.push((REPLICAS_ENV, template.replicas().to_string()));

        let containers = pod_spec
            .containers
            .iter_mut()
            .chain(pod_spec.init_containers.iter_mut().flatten());
        for container in containers {
            upsert_env(container, &env);
        }

        Ok(())
    }
}

fn template_id(template: &WorkloadTemplate) -> String {
    format!("{}/{}", template.namespace(), template.name())
}

fn add_entries(meta: &mut ObjectMeta, entries: &[(String, String)]) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in entries {
        labels.insert(key.clone(), value.clone());
        annotations.insert(key.clone(), value.clone());
    }
}

/// Require `label In [zone]`, appended to every existing required term.
///
/// Fails when an existing requirement on the same key already rules the zone
/// out, since the shard could then never be scheduled.
fn add_zone_affinity(
    pod_spec: &mut PodSpec,
    label: &str,
    zone: &str,
) -> std::result::Result<(), String> {
    let requirement = NodeSelectorRequirement {
        key: label.to_string(),
        operator: "In".to_string(),
        values: Some(vec![zone.to_string()]),
    };

    let node_affinity = pod_spec
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default);

    let selector = node_affinity
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);

    for term in &selector.node_selector_terms {
        for existing in term.match_expressions.iter().flatten() {
            if existing.key != label {
                continue;
            }
            let values = existing.values.as_deref().unwrap_or_default();
            let contains = values.iter().any(|v| v == zone);
            let excludes = match existing.operator.as_str() {
                "In" => !contains,
                "NotIn" => contains,
                "DoesNotExist" => true,
                _ => false,
            };
            if excludes {
                return Err(format!(
                    "existing node affinity on '{}' excludes zone '{}'",
                    label, zone
                ));
            }
        }
    }

    if selector.node_selector_terms.is_empty() {
        selector.node_selector_terms.push(NodeSelectorTerm {
            match_expressions: Some(vec![requirement]),
            ..Default::default()
        });
    } else {
        for term in &mut selector.node_selector_terms {
            term.match_expressions
                .get_or_insert_with(Vec::new)
                .push(requirement.clone());
        }
    }

    Ok(())
}

/// Set each `(name, value)`, overwriting an existing entry of the same name
fn upsert_env(container: &mut Container, vars: &[(&str, String)]) {
    let env = container.env.get_or_insert_with(Vec::new);
    for (name, value) in vars {
        match env.iter_mut().find(|e| e.name == *name) {
            Some(existing) => {
                existing.value = Some(value.clone());
                existing.value_from = None;
            }
            None => env.push(EnvVar {
                name: name.to_string(),
                value: Some(value.clone()),
                ..Default::default()
            }),
        }
    }
}
