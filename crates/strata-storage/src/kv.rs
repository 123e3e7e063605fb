use crate::Result;
use bytes::Bytes;

/// Key-value store trait
///
/// Single-key reads go through `get`; every write goes through a
/// `Transaction` so that read-check-write sequences are atomic.
pub trait KVStore: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Begin a write transaction
    fn transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// Transaction trait for atomic operations
///
/// Dropping an uncommitted transaction rolls it back.
pub trait Transaction: Send {
    /// Get a value by key, observing writes made earlier in this transaction
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Put a key-value pair
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Commit the transaction
    fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    fn rollback(self: Box<Self>) -> Result<()>;
}
