//! In-process key-value store.
//!
//! Suitable for tests and single-instance deployments. Expiry of values and
//! lock leases is measured against the injected [`Clock`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{KeyValueStore, LockHandle};
use crate::clock::{Clock, SystemClock};
use crate::config::GovernorConfig;
use crate::error::StoreError;

/// Lease applied to locks when none is configured.
const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(10);
/// First retry delay while a lock is contended.
const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
/// Upper bound on the retry delay.
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at_ms: i64,
}

/// A `KeyValueStore` held entirely in memory.
pub struct MemoryStore {
    /// Stored values by key
    values: DashMap<String, StoredValue>,
    /// Active lock leases by key
    locks: Mutex<HashMap<String, Lease>>,
    /// Time source for expiry
    clock: Arc<dyn Clock>,
    /// How long a lock may be held before others can take it over
    lock_lease: Duration,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("values", &self.values.len())
            .field("locks", &self.locks.lock().len())
            .field("lock_lease", &self.lock_lease)
            .finish()
    }
}

impl MemoryStore {
    /// Create a store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on a specific clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: DashMap::new(),
            locks: Mutex::new(HashMap::new()),
            clock,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }

    /// Create a store using the lock lease from governor configuration.
    pub fn from_config(clock: Arc<dyn Clock>, config: &GovernorConfig) -> Self {
        Self::with_clock(clock).with_lock_lease(config.lock_lease())
    }

    /// Set how long a lock survives without being released.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    /// Number of unexpired values.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.values
            .iter()
            .filter(|entry| entry.value().expires_at_ms > now)
            .count()
    }

    /// Whether the store holds no unexpired values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try to take every key at once. Returns `None` if any is held.
    fn try_lock(&self, keys: &[String]) -> Option<LockHandle> {
        let now = self.clock.now_millis();
        let mut locks = self.locks.lock();

        let contended = keys.iter().any(|key| {
            locks
                .get(key)
                .map(|lease| lease.expires_at_ms > now)
                .unwrap_or(false)
        });
        if contended {
            return None;
        }

        let handle = LockHandle::new(keys.to_vec());
        let lease = Lease {
            token: handle.token,
            expires_at_ms: now.saturating_add(
                i64::try_from(self.lock_lease.as_millis()).unwrap_or(i64::MAX),
            ),
        };
        for key in keys {
            // Overwrites any lease that has already run out.
            locks.insert(key.clone(), lease);
        }

        Some(handle)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now_millis();

        let value = self.values.get(key).map(|v| v.value().clone());
        match value {
            Some(stored) if stored.expires_at_ms > now => Ok(Some(stored.bytes)),
            Some(_) => {
                self.values.remove_if(key, |_, v| v.expires_at_ms <= now);
                trace!(key = %key, "Dropped expired value");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let ttl_ms = i64::try_from(ttl_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let expires_at_ms = self.clock.now_millis().saturating_add(ttl_ms);
        self.values.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn acquire_lock(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<LockHandle, StoreError> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let attempt = async {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                if let Some(handle) = self.try_lock(&keys) {
                    return handle;
                }
                let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64);
                tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        };

        let timeout_ms = timeout.as_millis() as u64;
        let outcome = tokio::time::timeout(timeout, attempt).await;
        match outcome {
            Ok(handle) => {
                trace!(keys = ?handle.keys, token = %handle.token, "Lock acquired");
                Ok(handle)
            }
            Err(_) => {
                debug!(keys = ?keys, timeout_ms = timeout_ms, "Lock wait timed out");
                Err(StoreError::LockTimeout { keys, timeout_ms })
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), StoreError> {
        let mut locks = self.locks.lock();
        for key in &handle.keys {
            // A lease taken over after expiry belongs to someone else now.
            if locks.get(key).map(|l| l.token == handle.token).unwrap_or(false) {
                locks.remove(key);
            }
        }
        trace!(keys = ?handle.keys, token = %handle.token, "Lock released");
        Ok(())
    }
}
