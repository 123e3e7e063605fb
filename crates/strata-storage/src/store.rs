//! Resource store: JSON objects keyed by [`ResourceKey`] with optimistic
//! concurrency and a broadcast event bus.
//!
//! Every write is one KV transaction. After the commit the written object is
//! published on the event bus; publishing is best-effort and never fails a
//! write.

use crate::{KVStore, KeyEncoder, Result, StorageError};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use strata_core::{GroupVersionKind, Resource, ResourceEvent, ResourceKey};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the broadcast channel
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Store boundary used by the controller
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch one object, `None` when it does not exist
    async fn get_object(&self, key: &ResourceKey) -> Result<Option<Value>>;

    /// All objects of a kind, optionally restricted to one namespace, in key order
    async fn list_objects(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>>;

    /// Store a new object. Assigns `uid`, `resourceVersion` and
    /// `creationTimestamp`; fails with `AlreadyExists` if the key is taken.
    async fn create_object(&self, key: &ResourceKey, object: Value) -> Result<Value>;

    /// Store several new objects in one transaction: either all of them are
    /// created or none is. Fails with `AlreadyExists` if any key is taken.
    async fn create_objects(&self, objects: Vec<(ResourceKey, Value)>) -> Result<Vec<Value>>;

    /// Replace an existing object. When the object carries a
    /// `resourceVersion` it must match the stored one, otherwise `Conflict`.
    async fn update_object(&self, key: &ResourceKey, object: Value) -> Result<Value>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent>;
}

/// [`ResourceStore`] over any [`KVStore`]
pub struct KvResourceStore {
    kv: Arc<dyn KVStore>,
    event_tx: broadcast::Sender<ResourceEvent>,
}

impl KvResourceStore {
    /// Create a store with the default event bus config
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self::with_event_bus_config(kv, EventBusConfig::default())
    }

    /// Create a store with a custom event bus config
    pub fn with_event_bus_config(kv: Arc<dyn KVStore>, config: EventBusConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.capacity);
        Self { kv, event_tx }
    }

    fn publish(&self, event: ResourceEvent) {
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }
}

fn metadata_mut<'a>(
    object: &'a mut Value,
    key: &ResourceKey,
) -> Result<&'a mut Map<String, Value>> {
    let root = object
        .as_object_mut()
        .ok_or_else(|| StorageError::invalid_object(format!("{} is not a JSON object", key)))?;

    root.insert("apiVersion".to_string(), Value::String(key.gvk.api_version()));
    root.insert("kind".to_string(), Value::String(key.gvk.kind.clone()));

    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    let metadata = metadata
        .as_object_mut()
        .ok_or_else(|| StorageError::invalid_object(format!("{} has malformed metadata", key)))?;

    metadata.insert("name".to_string(), Value::String(key.name.clone()));
    if key.is_namespaced() {
        metadata.insert("namespace".to_string(), Value::String(key.namespace.clone()));
    }

    Ok(metadata)
}

fn metadata_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object.get("metadata")?.get(field)?.as_str()
}

#[async_trait]
impl ResourceStore for KvResourceStore {
    async fn get_object(&self, key: &ResourceKey) -> Result<Option<Value>> {
        debug!("Getting object: {}", key);

        let storage_key = KeyEncoder::encode_resource_key(key);
        match self.kv.get(storage_key.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn list_objects(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>> {
        let prefix = KeyEncoder::encode_prefix(gvk, namespace);

        let mut objects = Vec::new();
        for (key, data) in self.kv.scan(prefix.as_bytes())? {
            let key = String::from_utf8_lossy(&key);
            if KeyEncoder::parse_key(&key).is_none() {
                warn!("Skipping object under unparseable key {}", key);
                continue;
            }
            objects.push(serde_json::from_slice(&data)?);
        }

        debug!("Listed {} {} objects", objects.len(), gvk);
        Ok(objects)
    }

    async fn create_object(&self, key: &ResourceKey, object: Value) -> Result<Value> {
        let mut created = self.create_objects(vec![(key.clone(), object)]).await?;
        created
            .pop()
            .ok_or_else(|| StorageError::transaction_error(format!("{} was not written", key)))
    }

    async fn create_objects(&self, objects: Vec<(ResourceKey, Value)>) -> Result<Vec<Value>> {
        let mut pending = Vec::with_capacity(objects.len());
        for (key, mut object) in objects {
            let resource_version = Uuid::new_v4().to_string();
            {
                let metadata = metadata_mut(&mut object, &key)?;
                metadata.insert("uid".to_string(), Value::String(Uuid::new_v4().to_string()));
                metadata.insert(
                    "resourceVersion".to_string(),
                    Value::String(resource_version.clone()),
                );
                metadata.insert(
                    "creationTimestamp".to_string(),
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
            }
            let data = serde_json::to_vec(&object)?;
            pending.push((key, object, data, resource_version));
        }

        let mut txn = self.kv.transaction()?;
        for (index, (key, ..)) in pending.iter().enumerate() {
            let storage_key = KeyEncoder::encode_resource_key(key);
            let duplicate = pending[..index].iter().any(|(other, ..)| other == key);
            if duplicate || txn.get(storage_key.as_bytes())?.is_some() {
                return Err(StorageError::already_exists(storage_key));
            }
        }
        for (key, _, data, _) in &pending {
            txn.put(KeyEncoder::encode_resource_key(key).as_bytes(), data)?;
        }
        txn.commit()?;

        let mut created = Vec::with_capacity(pending.len());
        for (key, object, _, resource_version) in pending {
            info!("Created {} at resourceVersion {}", key, resource_version);
            self.publish(ResourceEvent::added(key, object.clone(), resource_version));
            created.push(object);
        }

        Ok(created)
    }

    async fn update_object(&self, key: &ResourceKey, mut object: Value) -> Result<Value> {
        let storage_key = KeyEncoder::encode_resource_key(key);
        let expected = metadata_str(&object, "resourceVersion").map(str::to_string);

        let mut txn = self.kv.transaction()?;
        let stored: Value = match txn.get(storage_key.as_bytes())? {
            Some(data) => serde_json::from_slice(&data)?,
            None => return Err(StorageError::key_not_found(storage_key)),
        };

        let actual = metadata_str(&stored, "resourceVersion").unwrap_or_default();
        if let Some(expected) = expected.as_deref() {
            if expected != actual {
                return Err(StorageError::conflict(storage_key, expected, actual));
            }
        }

        let resource_version = Uuid::new_v4().to_string();
        {
            let metadata = metadata_mut(&mut object, key)?;
            for field in ["uid", "creationTimestamp"] {
                match metadata_str(&stored, field) {
                    Some(value) => {
                        metadata.insert(field.to_string(), Value::String(value.to_string()));
                    }
                    None => {
                        metadata.remove(field);
                    }
                }
            }
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(resource_version.clone()),
            );
        }

        let data = serde_json::to_vec(&object)?;
        txn.put(storage_key.as_bytes(), &data)?;
        txn.commit()?;

        debug!("Updated {} to resourceVersion {}", key, resource_version);
        self.publish(ResourceEvent::modified(
            key.clone(),
            object.clone(),
            resource_version,
        ));

        Ok(object)
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }
}

fn resource_key_of<T: Resource>(resource: &T) -> Result<ResourceKey> {
    resource
        .resource_key()
        .map_err(|e| StorageError::invalid_object(e.to_string()))
}

/// Get a typed resource, `None` when it does not exist
pub async fn get_resource<T: Resource, S: ResourceStore + ?Sized>(
    store: &S,
    namespace: &str,
    name: &str,
) -> Result<Option<T>> {
    match store.get_object(&T::key_for(namespace, name)).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// List typed resources, optionally within one namespace
pub async fn list_resources<T: Resource, S: ResourceStore + ?Sized>(
    store: &S,
    namespace: Option<&str>,
) -> Result<Vec<T>> {
    store
        .list_objects(&T::type_gvk(), namespace)
        .await?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(StorageError::from))
        .collect()
}

/// Create a typed resource
pub async fn create_resource<T: Resource, S: ResourceStore + ?Sized>(
    store: &S,
    resource: T,
) -> Result<T> {
    let key = resource_key_of(&resource)?;
    let created = store
        .create_object(&key, serde_json::to_value(&resource)?)
        .await?;
    Ok(serde_json::from_value(created)?)
}

/// Create several typed resources atomically
pub async fn create_resources<T: Resource, S: ResourceStore + ?Sized>(
    store: &S,
    resources: Vec<T>,
) -> Result<Vec<T>> {
    let mut objects = Vec::with_capacity(resources.len());
    for resource in &resources {
        objects.push((resource_key_of(resource)?, serde_json::to_value(resource)?));
    }

    store
        .create_objects(objects)
        .await?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(StorageError::from))
        .collect()
}

/// Update a typed resource
pub async fn update_resource<T: Resource, S: ResourceStore + ?Sized>(
    store: &S,
    resource: T,
) -> Result<T> {
    let key = resource_key_of(&resource)?;
    let updated = store
        .update_object(&key, serde_json::to_value(&resource)?)
        .await?;
    Ok(serde_json::from_value(updated)?)
}
