//! Strata Controller - turns WorkloadTemplates into versioned, zone-sharded
//! StatefulSets
//!
//! This crate provides:
//! - ContentHasher: digest of the ConfigMaps/Secrets a pod spec consumes
//! - ZoneSharder: per-zone expansion of a template
//! - ReferenceIndex: changed config object -> templates to re-reconcile
//! - OwnershipManager: controller and weak owner references
//! - VersionedWorkloadReconciler: the reconcile algorithm
//! - WorkloadController: work queue, worker pool and event bridge

pub mod config;
pub mod controller;
pub mod error;
pub mod hasher;
pub mod owner;
pub mod queue;
pub mod reconciler;
pub mod reference;
pub mod registry;
pub mod zones;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{BackoffConfig, ControllerConfig};
pub use controller::WorkloadController;
pub use error::{ControllerError, Result};
pub use hasher::ContentHasher;
pub use owner::OwnershipManager;
pub use queue::WorkQueue;
pub use reconciler::{
    discover_instances, template_digest, ReconcileOutcome, ReconcileRequest,
    VersionedInstance, VersionedWorkloadReconciler,
};
pub use reference::ReferenceIndex;
pub use registry::{KindRegistry, KindRole};
pub use zones::ZoneSharder;

/// Positive integer version of an instance
pub const ANNOTATION_VERSION: &str = "strata.io/version";
/// JSON array of the template's zones at the time the version was cut
pub const ANNOTATION_ZONES: &str = "strata.io/zones";
/// Content hash of referenced config, only with `updateOnConfigChange`
pub const ANNOTATION_CONFIG_SHA: &str = "strata.io/config-sha256";
/// Structural digest of the template the version was cut from
pub const ANNOTATION_TEMPLATE_SHA: &str = "strata.io/template-sha256";

pub const LABEL_TEMPLATE_NAME: &str = "strata.io/template-name";
pub const LABEL_AZ_INDEX: &str = "strata.io/az-index";
pub const LABEL_AZ_NAME: &str = "strata.io/az-name";
