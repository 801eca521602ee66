//! Key-value store abstraction consumed by the rate limit governor.
//!
//! The governor never keeps state in process; every decision reads and
//! writes through a `KeyValueStore`, and the store's lock primitive is what
//! makes the read-decide-write sequence safe across a fleet of instances.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;

pub use memory::MemoryStore;

/// Proof of ownership of a set of locked keys.
///
/// Returned by [`KeyValueStore::acquire_lock`] and handed back to
/// [`KeyValueStore::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Keys covered by this lock
    pub keys: Vec<String>,
    /// Unique owner token
    pub token: Uuid,
}

impl LockHandle {
    /// Create a handle with a fresh owner token.
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            token: Uuid::new_v4(),
        }
    }
}

/// Trait for key-value stores with expiring values and distributed locks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, returning `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value that expires after `ttl_secs` seconds.
    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl_secs: u64)
        -> Result<(), StoreError>;

    /// Lock every key in `keys` or none of them, waiting at most `timeout`.
    ///
    /// Fails with [`StoreError::LockTimeout`] when the wait runs out.
    async fn acquire_lock(&self, keys: &[String], timeout: Duration)
        -> Result<LockHandle, StoreError>;

    /// Release a lock previously returned by `acquire_lock`.
    async fn release(&self, handle: LockHandle) -> Result<(), StoreError>;
}
