//! Strata Storage - Storage abstraction, redb backend and the resource store
//!
//! This crate provides:
//! - KVStore trait for storage abstraction
//! - redb-based implementation
//! - Key encoding
//! - ResourceStore: typed get/list/create/update with optimistic concurrency
//!   and a broadcast event bus

pub mod encoding;
pub mod error;
pub mod kv;
pub mod redb_backend;
pub mod store;

// Re-export commonly used types
pub use encoding::KeyEncoder;
pub use error::{Result, StorageError};
pub use kv::{KVStore, Transaction};
pub use redb_backend::RedbBackend;
pub use store::{
    create_resource, create_resources, get_resource, list_resources, update_resource,
    EventBusConfig, KvResourceStore, ResourceStore,
};
