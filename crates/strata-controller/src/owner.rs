use crate::registry::KindRegistry;
use crate::{ControllerError, Result};
use strata_core::{OwnerReference, Resource};

/// Stamps and inspects `metadata.ownerReferences`
///
/// A controller reference ties a versioned instance to the one template that
/// created it. A weak reference (`controller = false`) ties a configuration
/// object to every template that wants to hear about its changes; any number
/// of templates may hold one.
#[derive(Debug, Clone)]
pub struct OwnershipManager {
    registry: KindRegistry,
}

impl OwnershipManager {
    pub fn new(registry: KindRegistry) -> Self {
        Self { registry }
    }

    fn reference_to<O: Resource>(&self, owner: &O, controller: bool) -> Result<OwnerReference> {
        let gvk = O::type_gvk();
        if !self.registry.is_template(&gvk) {
            return Err(ControllerError::internal_error(format!(
                "{} is not registered as an owning kind",
                gvk
            )));
        }

        let uid = owner.uid().ok_or_else(|| {
            ControllerError::internal_error(format!(
                "owner {}/{} has no uid; it must be read from the store first",
                owner.namespace(),
                owner.name()
            ))
        })?;

        Ok(OwnerReference {
            api_version: O::API_VERSION.to_string(),
            kind: O::KIND.to_string(),
            name: owner.name().to_string(),
            uid,
            controller: Some(controller),
            block_owner_deletion: Some(true),
        })
    }

    /// Make `owner` the controller of `object`.
    ///
    /// Returns whether the object changed. Fails with `InvalidSpec` when a
    /// different controller already owns it.
    pub fn attach_controller_owner<T: Resource, O: Resource>(
        &self,
        object: &mut T,
        owner: &O,
    ) -> Result<bool> {
        let reference = self.reference_to(owner, true)?;

        if let Some(existing) = controller_ref(object) {
            if existing.uid == reference.uid {
                return Ok(false);
            }
            return Err(ControllerError::invalid_spec(
                format!("{}/{}", owner.namespace(), owner.name()),
                format!(
                    "{} is already controlled by {} {}",
                    object.name(),
                    existing.kind,
                    existing.name
                ),
            ));
        }

        object
            .metadata_mut()
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(reference);
        Ok(true)
    }

    /// Add a non-controller reference from `owner` if absent
    pub fn attach_weak_owner<T: Resource, O: Resource>(
        &self,
        object: &mut T,
        owner: &O,
    ) -> Result<bool> {
        let reference = self.reference_to(owner, false)?;

        let refs = object
            .metadata_mut()
            .owner_references
            .get_or_insert_with(Vec::new);
        if refs.iter().any(|r| r.uid == reference.uid) {
            return Ok(false);
        }
        refs.push(reference);
        Ok(true)
    }

    /// Drop `owner`'s non-controller reference; returns whether one was removed
    pub fn remove_weak_owner<T: Resource, O: Resource>(&self, object: &mut T, owner: &O) -> bool {
        let Some(uid) = owner.uid() else {
            return false;
        };
        let Some(refs) = object.metadata_mut().owner_references.as_mut() else {
            return false;
        };

        let before = refs.len();
        refs.retain(|r| r.uid != uid || is_controller(r));
        let removed = refs.len() != before;

        if refs.is_empty() {
            object.metadata_mut().owner_references = None;
        }
        removed
    }

    pub fn is_controlled_by<T: Resource, O: Resource>(&self, object: &T, owner: &O) -> bool {
        match (controller_ref(object), owner.uid()) {
            (Some(existing), Some(uid)) => existing.uid == uid,
            _ => false,
        }
    }

    pub fn has_weak_owner<T: Resource, O: Resource>(&self, object: &T, owner: &O) -> bool {
        let Some(uid) = owner.uid() else {
            return false;
        };
        object
            .metadata()
            .owner_references
            .iter()
            .flatten()
            .any(|r| r.uid == uid && !is_controller(r))
    }
}

fn is_controller(reference: &OwnerReference) -> bool {
    reference.controller == Some(true)
}

/// The controller reference of `object`, if any
pub fn controller_ref<T: Resource>(object: &T) -> Option<&OwnerReference> {
    object
        .metadata()
        .owner_references
        .iter()
        .flatten()
        .find(|r| is_controller(r))
}
