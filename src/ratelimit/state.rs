//! Rate limit records as persisted in the key-value store.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const MILLIS_PER_MINUTE: i64 = 60_000;

/// Convert a whole number of minutes to milliseconds, saturating at `i64::MAX`.
pub fn minutes_to_millis(minutes: u64) -> i64 {
    i64::try_from(minutes)
        .unwrap_or(i64::MAX)
        .saturating_mul(MILLIS_PER_MINUTE)
}

/// Store TTL for a record expiring at `expires_at_ms`.
///
/// Rounded up to whole seconds and never below one, so the store never
/// drops a record before its embedded expiry.
pub fn ttl_secs(expires_at_ms: i64, now_ms: i64) -> u64 {
    let remaining = expires_at_ms.saturating_sub(now_ms).max(1);
    (remaining / 1000 + i64::from(remaining % 1000 != 0)) as u64
}

/// A request counter inside a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Admissions granted in this window
    pub count: u64,
    /// End of the window in epoch milliseconds
    pub expiration_time_millis: i64,
}

impl RateLimitState {
    /// Open a window holding the first admission.
    pub fn first(now_ms: i64, window_ms: i64) -> Self {
        Self {
            count: 1,
            expiration_time_millis: now_ms.saturating_add(window_ms),
        }
    }

    /// Whether the window is still open at `now_ms`.
    pub fn is_active(&self, now_ms: i64) -> bool {
        now_ms < self.expiration_time_millis
    }

    /// The same window with one more admission.
    pub fn incremented(&self) -> Self {
        Self {
            count: self.count.saturating_add(1),
            expiration_time_millis: self.expiration_time_millis,
        }
    }

    /// Serialize to the stored JSON form.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the stored JSON form.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Flag that denies every admission until it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspensionRecord {
    /// Always true when written by the governor
    pub suspended: bool,
    /// End of the suspension in epoch milliseconds
    pub until_millis: i64,
}

impl SuspensionRecord {
    /// A suspension lasting until `until_millis`.
    pub fn until(until_millis: i64) -> Self {
        Self {
            suspended: true,
            until_millis,
        }
    }

    /// Whether this record still denies at `now_ms`.
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.suspended && now_ms < self.until_millis
    }

    /// Serialize to the stored JSON form.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the stored JSON form.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Read-only view of a key's state at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// No open window and no suspension
    Unset,
    /// A window is open
    Active { count: u64, expires_at_ms: i64 },
    /// Every request is denied until `until_ms`
    Suspended { until_ms: i64 },
}
