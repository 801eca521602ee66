//! Store-backed rate limit governor.
//!
//! Every decision runs as one locked sequence against the shared
//! key-value store: acquire the key's lock, read the suspension flag and
//! counter, decide, write the new state, release. Nothing is cached in
//! process, so any number of instances can share one store.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::config::GovernorConfig;
use crate::error::{GovernorError, StoreError};
use crate::store::KeyValueStore;

use super::key::RateLimitKey;
use super::rules::{PolicyRules, RatePolicy};
use super::state::{minutes_to_millis, ttl_secs, KeyStatus, RateLimitState, SuspensionRecord};

/// Default wait for the per-key lock.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Admits or denies requests per `(subject, operation)` using a fixed
/// window counter that escalates to a timed suspension.
///
/// Decision table, evaluated under the key's lock:
///
/// | state                              | action                                  |
/// |------------------------------------|-----------------------------------------|
/// | suspended                          | deny, suspension untouched              |
/// | no counter, or window expired      | open window with count 1, admit         |
/// | window open, `count < max`         | increment, keep original expiry, admit  |
/// | window open, `count >= max`        | arm suspension, deny                    |
pub struct RateLimitGovernor {
    /// Shared state and locks
    store: Arc<dyn KeyValueStore>,
    /// Time source for window and suspension expiry
    clock: Arc<dyn Clock>,
    /// Maximum wait for the per-key lock
    lock_timeout: Duration,
    /// Policies used by `admit_operation`
    rules: RwLock<PolicyRules>,
}

impl std::fmt::Debug for RateLimitGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGovernor")
            .field("lock_timeout", &self.lock_timeout)
            .field("rules", &*self.rules.read())
            .finish()
    }
}

impl RateLimitGovernor {
    /// Create a governor with default lock timeout and policies.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            rules: RwLock::new(PolicyRules::default()),
        }
    }

    /// Create a governor from configuration, loading policy rules if a path is set.
    pub fn from_config(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: &GovernorConfig,
    ) -> crate::error::Result<Self> {
        let rules = match &config.policies_path {
            // The rules file carries its own default policy.
            Some(path) => PolicyRules::from_file(path)?,
            None => PolicyRules::new(config.default_policy),
        };

        Ok(Self::new(store, clock)
            .with_lock_timeout(config.lock_timeout())
            .with_rules(rules))
    }

    /// Set the maximum wait for the per-key lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the policies used by `admit_operation`.
    pub fn with_rules(mut self, rules: PolicyRules) -> Self {
        *self.rules.get_mut() = rules;
        self
    }

    /// Replace the policies used by `admit_operation`.
    pub fn set_rules(&self, rules: PolicyRules) {
        *self.rules.write() = rules;
    }

    /// Get the current policies.
    pub fn rules(&self) -> PolicyRules {
        self.rules.read().clone()
    }

    /// Decide whether `subject_id` may perform `operation_name` now.
    ///
    /// Returns `Ok(true)` on admission. Denials are reported as
    /// [`GovernorError::RateLimitExceeded`]; lock and store failures keep
    /// their own kinds and never admit.
    pub async fn admit(
        &self,
        subject_id: &str,
        operation_name: &str,
        window_minutes: u64,
        suspension_minutes: u64,
        max_requests: u64,
    ) -> Result<bool, GovernorError> {
        let policy = RatePolicy {
            window_minutes,
            suspension_minutes,
            max_requests,
        };
        self.admit_with_policy(subject_id, operation_name, &policy)
            .await
    }

    /// Like [`admit`](Self::admit), using the configured policy for the operation.
    pub async fn admit_operation(
        &self,
        subject_id: &str,
        operation_name: &str,
    ) -> Result<bool, GovernorError> {
        let policy = *self.rules.read().policy_for(operation_name);
        self.admit_with_policy(subject_id, operation_name, &policy)
            .await
    }

    /// Like [`admit`](Self::admit), but a denial is `Ok(false)`.
    ///
    /// Lock and store failures are still errors.
    pub async fn try_admit(
        &self,
        subject_id: &str,
        operation_name: &str,
        window_minutes: u64,
        suspension_minutes: u64,
        max_requests: u64,
    ) -> Result<bool, GovernorError> {
        match self
            .admit(
                subject_id,
                operation_name,
                window_minutes,
                suspension_minutes,
                max_requests,
            )
            .await
        {
            Err(e) if e.is_rate_limited() => Ok(false),
            other => other,
        }
    }

    /// Run one locked decision for `policy`.
    pub async fn admit_with_policy(
        &self,
        subject_id: &str,
        operation_name: &str,
        policy: &RatePolicy,
    ) -> Result<bool, GovernorError> {
        policy.validate().map_err(GovernorError::InvalidPolicy)?;

        let key = RateLimitKey::new(subject_id, operation_name);
        trace!(
            key = %key,
            window_minutes = policy.window_minutes,
            max_requests = policy.max_requests,
            "Checking rate limit"
        );

        let handle = self
            .store
            .acquire_lock(&key.lock_keys(), self.lock_timeout)
            .await
            .map_err(|e| match e {
                StoreError::LockTimeout { timeout_ms, .. } => {
                    warn!(key = %key, timeout_ms = timeout_ms, "Could not acquire rate limit lock");
                    GovernorError::LockAcquisitionFailed {
                        subject: key.subject_id.clone(),
                        operation: key.operation_name.clone(),
                        timeout_ms,
                    }
                }
                other => GovernorError::StoreUnavailable(other),
            })?;

        let outcome = self.decide(&key, policy).await;

        // The lease bounds how long a failed release can block the key.
        if let Err(e) = self.store.release(handle).await {
            warn!(key = %key, error = %e, "Failed to release rate limit lock");
        }

        outcome
    }

    /// Read, decide and write. Must only run while holding the key's lock.
    async fn decide(&self, key: &RateLimitKey, policy: &RatePolicy) -> Result<bool, GovernorError> {
        let now = self.clock.now_millis();

        if let Some(record) = self.read_suspension(key).await? {
            if record.is_active(now) {
                debug!(key = %key, until = record.until_millis, "Denied while suspended");
                return Err(exceeded(key, record.until_millis.saturating_sub(now)));
            }
        }

        let count_key = key.count_key();
        match self.read_counter(key).await? {
            Some(state) if state.is_active(now) && state.count < policy.max_requests => {
                let next = state.incremented();
                self.store
                    .set_with_expiry(
                        &count_key,
                        next.encode()?,
                        ttl_secs(next.expiration_time_millis, now),
                    )
                    .await?;

                debug!(
                    key = %key,
                    count = next.count,
                    limit = policy.max_requests,
                    "Admitted within window"
                );
                Ok(true)
            }
            Some(state) if state.is_active(now) => {
                // The counter is left to expire on its own.
                let until = now.saturating_add(minutes_to_millis(policy.suspension_minutes));
                let record = SuspensionRecord::until(until);
                self.store
                    .set_with_expiry(&key.suspended_key(), record.encode()?, ttl_secs(until, now))
                    .await?;

                warn!(
                    key = %key,
                    count = state.count,
                    limit = policy.max_requests,
                    suspension_minutes = policy.suspension_minutes,
                    "Rate limit exceeded, suspending"
                );
                Err(exceeded(key, until.saturating_sub(now)))
            }
            _ => {
                let fresh = RateLimitState::first(now, minutes_to_millis(policy.window_minutes));
                self.store
                    .set_with_expiry(
                        &count_key,
                        fresh.encode()?,
                        ttl_secs(fresh.expiration_time_millis, now),
                    )
                    .await?;

                debug!(
                    key = %key,
                    expires_at = fresh.expiration_time_millis,
                    "Opened new rate limit window"
                );
                Ok(true)
            }
        }
    }

    /// Report the state of a key without locking or changing it.
    pub async fn inspect(
        &self,
        subject_id: &str,
        operation_name: &str,
    ) -> Result<KeyStatus, GovernorError> {
        let key = RateLimitKey::new(subject_id, operation_name);
        let now = self.clock.now_millis();

        if let Some(record) = self.read_suspension(&key).await? {
            if record.is_active(now) {
                return Ok(KeyStatus::Suspended {
                    until_ms: record.until_millis,
                });
            }
        }

        Ok(match self.read_counter(&key).await? {
            Some(state) if state.is_active(now) => KeyStatus::Active {
                count: state.count,
                expires_at_ms: state.expiration_time_millis,
            },
            _ => KeyStatus::Unset,
        })
    }

    async fn read_suspension(
        &self,
        key: &RateLimitKey,
    ) -> Result<Option<SuspensionRecord>, StoreError> {
        match self.store.get(&key.suspended_key()).await? {
            Some(bytes) => Ok(Some(SuspensionRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_counter(&self, key: &RateLimitKey) -> Result<Option<RateLimitState>, StoreError> {
        match self.store.get(&key.count_key()).await? {
            Some(bytes) => Ok(Some(RateLimitState::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn exceeded(key: &RateLimitKey, retry_after_ms: i64) -> GovernorError {
    GovernorError::RateLimitExceeded {
        subject: key.subject_id.clone(),
        operation: key.operation_name.clone(),
        retry_after_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{LockHandle, MemoryStore};
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    const T0: i64 = 1_700_000_000_000;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>, RateLimitGovernor) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let governor = RateLimitGovernor::new(store.clone(), clock.clone());
        (clock, store, governor)
    }

    fn assert_exceeded(result: Result<bool, GovernorError>) -> i64 {
        match result {
            Err(GovernorError::RateLimitExceeded { retry_after_ms, .. }) => retry_after_ms,
            other => panic!("expected RateLimitExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_call_opens_window() {
        let (_, _, governor) = setup();

        assert!(assert_ok!(governor.admit("user", "login", 1, 5, 3).await));
        assert_eq!(
            governor.inspect("user", "login").await.unwrap(),
            KeyStatus::Active {
                count: 1,
                expires_at_ms: T0 + 60_000
            }
        );
    }

    #[tokio::test]
    async fn test_admits_up_to_limit_then_denies() {
        let (_, _, governor) = setup();

        for n in 1..=4 {
            assert!(
                governor.admit("user", "login", 1, 5, 4).await.unwrap(),
                "request {} should be admitted",
                n
            );
        }
        for _ in 5..=8 {
            assert_exceeded(governor.admit("user", "login", 1, 5, 4).await);
        }
    }

    #[tokio::test]
    async fn test_window_does_not_slide() {
        let (clock, _, governor) = setup();

        governor.admit("user", "login", 1, 5, 10).await.unwrap();
        clock.advance(Duration::from_secs(40));
        governor.admit("user", "login", 1, 5, 10).await.unwrap();

        assert_eq!(
            governor.inspect("user", "login").await.unwrap(),
            KeyStatus::Active {
                count: 2,
                expires_at_ms: T0 + 60_000
            }
        );

        // Past the original expiry a fresh window starts at count 1.
        clock.advance(Duration::from_secs(20));
        governor.admit("user", "login", 1, 5, 10).await.unwrap();
        assert_eq!(
            governor.inspect("user", "login").await.unwrap(),
            KeyStatus::Active {
                count: 1,
                expires_at_ms: T0 + 120_000
            }
        );
    }

    #[tokio::test]
    async fn test_full_suspension_cycle() {
        // window 1 minute, limit 2, suspension 5 minutes
        let (clock, _, governor) = setup();

        assert!(governor.admit("user", "publish", 1, 5, 2).await.unwrap());
        assert!(governor.admit("user", "publish", 1, 5, 2).await.unwrap());

        let retry = assert_exceeded(governor.admit("user", "publish", 1, 5, 2).await);
        assert_eq!(retry, 300_000);
        assert_eq!(
            governor.inspect("user", "publish").await.unwrap(),
            KeyStatus::Suspended {
                until_ms: T0 + 300_000
            }
        );

        // Counter window has expired but suspension still holds.
        clock.advance(Duration::from_secs(90));
        let retry = assert_exceeded(governor.admit("user", "publish", 1, 5, 2).await);
        assert_eq!(retry, 210_000);

        // Suspension over: a fresh window of two admissions.
        clock.set(T0 + 300_000);
        assert!(governor.admit("user", "publish", 1, 5, 2).await.unwrap());
        assert!(governor.admit("user", "publish", 1, 5, 2).await.unwrap());
        assert_exceeded(governor.admit("user", "publish", 1, 5, 2).await);
    }

    #[tokio::test]
    async fn test_denials_do_not_extend_suspension() {
        let (clock, _, governor) = setup();

        governor.admit("user", "login", 1, 5, 1).await.unwrap();
        assert_exceeded(governor.admit("user", "login", 1, 5, 1).await);

        for _ in 0..4 {
            clock.advance(Duration::from_secs(60));
            assert_exceeded(governor.admit("user", "login", 1, 5, 1).await);
        }

        clock.advance(Duration::from_secs(60));
        assert!(governor.admit("user", "login", 1, 5, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_huge_window_still_enforces_limit() {
        let (clock, _, governor) = setup();

        for window in [u64::MAX, i64::MAX as u64] {
            let subject = format!("user-{}", window);
            assert!(governor.admit(&subject, "login", window, 5, 2).await.unwrap());
            assert!(governor.admit(&subject, "login", window, 5, 2).await.unwrap());
            assert_exceeded(governor.admit(&subject, "login", window, 5, 2).await);

            assert_eq!(
                governor.inspect(&subject, "login").await.unwrap(),
                KeyStatus::Suspended {
                    until_ms: T0 + 300_000
                }
            );
        }

        // After the suspension the window is still open and still full.
        clock.advance(Duration::from_secs(301));
        assert_exceeded(governor.admit(&format!("user-{}", u64::MAX), "login", u64::MAX, 5, 2).await);
    }

    #[tokio::test]
    async fn test_huge_suspension_holds() {
        let (clock, _, governor) = setup();

        assert!(governor.admit("user", "login", 1, u64::MAX, 1).await.unwrap());
        let retry = assert_exceeded(governor.admit("user", "login", 1, u64::MAX, 1).await);
        assert_eq!(retry, i64::MAX - T0);

        clock.advance(Duration::from_secs(61));
        let retry = assert_exceeded(governor.admit("user", "login", 1, u64::MAX, 1).await);
        assert!(retry > 0);
        assert_eq!(
            governor.inspect("user", "login").await.unwrap(),
            KeyStatus::Suspended { until_ms: i64::MAX }
        );
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_, _, governor) = setup();

        governor.admit("alice", "login", 1, 5, 1).await.unwrap();
        assert_exceeded(governor.admit("alice", "login", 1, 5, 1).await);

        assert!(governor.admit("bob", "login", 1, 5, 1).await.unwrap());
        assert!(governor.admit("alice", "publish", 1, 5, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_try_admit_reports_false() {
        let (_, _, governor) = setup();

        assert!(governor.try_admit("user", "login", 1, 5, 1).await.unwrap());
        assert!(!governor.try_admit("user", "login", 1, 5, 1).await.unwrap());
        assert!(!governor.try_admit("user", "login", 1, 5, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_invalid_policy() {
        let (_, store, governor) = setup();

        let err = assert_err!(governor.admit("user", "login", 1, 5, 0).await);
        assert!(matches!(err, GovernorError::InvalidPolicy(_)));
        let err = assert_err!(governor.admit("user", "login", 0, 5, 3).await);
        assert!(matches!(err, GovernorError::InvalidPolicy(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lock_timeout_is_distinct_and_fails_closed() {
        let (_, store, governor) = setup();
        let governor = governor.with_lock_timeout(Duration::from_millis(30));

        let key = RateLimitKey::new("user", "login");
        let held = store
            .acquire_lock(&key.lock_keys(), Duration::ZERO)
            .await
            .unwrap();

        let err = assert_err!(governor.admit("user", "login", 1, 5, 3).await);
        assert!(matches!(
            err,
            GovernorError::LockAcquisitionFailed { timeout_ms: 30, .. }
        ));
        assert!(!err.is_rate_limited());
        assert_eq!(governor.inspect("user", "login").await.unwrap(), KeyStatus::Unset);

        // try_admit must not turn infrastructure failure into a plain denial.
        assert_err!(governor.try_admit("user", "login", 1, 5, 3).await);

        store.release(held).await.unwrap();
        assert!(governor.admit("user", "login", 1, 5, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_released_after_denial() {
        let (_, _, governor) = setup();
        // A zero timeout only succeeds if nothing is still holding the key.
        let governor = governor.with_lock_timeout(Duration::ZERO);

        governor.admit("user", "login", 1, 5, 1).await.unwrap();
        for _ in 0..3 {
            assert_exceeded(governor.admit("user", "login", 1, 5, 1).await);
        }
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_store_error() {
        let (_, store, governor) = setup();
        let governor = governor.with_lock_timeout(Duration::ZERO);

        let key = RateLimitKey::new("user", "login");
        store
            .set_with_expiry(&key.count_key(), b"garbage".to_vec(), 60)
            .await
            .unwrap();

        let err = assert_err!(governor.admit("user", "login", 1, 5, 3).await);
        assert!(matches!(
            err,
            GovernorError::StoreUnavailable(StoreError::Codec(_))
        ));

        // Lock released on the error path too.
        let err = assert_err!(governor.admit("user", "login", 1, 5, 3).await);
        assert!(matches!(err, GovernorError::StoreUnavailable(_)));
    }

    struct UnavailableStore;

    #[async_trait]
    impl KeyValueStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn set_with_expiry(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl_secs: u64,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn acquire_lock(
            &self,
            keys: &[String],
            _timeout: Duration,
        ) -> Result<LockHandle, StoreError> {
            Ok(LockHandle::new(keys.to_vec()))
        }

        async fn release(&self, _handle: LockHandle) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let clock = Arc::new(ManualClock::new(T0));
        let governor = RateLimitGovernor::new(Arc::new(UnavailableStore), clock);

        let err = assert_err!(governor.admit("user", "login", 1, 5, 3).await);
        assert!(matches!(
            err,
            GovernorError::StoreUnavailable(StoreError::Unavailable(_))
        ));
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn test_admit_operation_uses_rules() {
        let (_, _, governor) = setup();
        let rules = PolicyRules::from_yaml(
            r#"
default:
  max_requests: 5
operations:
  - name: password_reset
    window_minutes: 10
    suspension_minutes: 60
    max_requests: 1
"#,
        )
        .unwrap();
        governor.set_rules(rules);

        assert!(governor.admit_operation("user", "password_reset").await.unwrap());
        let retry = assert_exceeded(governor.admit_operation("user", "password_reset").await);
        assert_eq!(retry, 3_600_000);

        for _ in 0..5 {
            assert!(governor.admit_operation("user", "login").await.unwrap());
        }
        assert_exceeded(governor.admit_operation("user", "login").await);
    }

    #[tokio::test]
    async fn test_from_config_defaults() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let mut config = GovernorConfig::default();
        config.default_policy.max_requests = 2;
        config.lock_timeout_ms = 100;

        let governor = RateLimitGovernor::from_config(store, clock, &config).unwrap();
        assert_eq!(governor.rules().default.max_requests, 2);

        assert!(governor.admit_operation("user", "any").await.unwrap());
        assert!(governor.admit_operation("user", "any").await.unwrap());
        assert_exceeded(governor.admit_operation("user", "any").await);
    }

    #[tokio::test]
    async fn test_from_config_missing_rules_file() {
        let (clock, store, _) = setup();
        let config = GovernorConfig {
            policies_path: Some("/nonexistent/policies.yaml".to_string()),
            ..GovernorConfig::default()
        };
        assert!(RateLimitGovernor::from_config(store, clock, &config).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_exceed_limit() {
        let (_, _, governor) = setup();
        let governor = Arc::new(governor.with_lock_timeout(Duration::from_secs(30)));

        let calls = (0..40).map(|_| {
            let governor = governor.clone();
            tokio::spawn(async move { governor.admit("user", "upload", 1, 5, 7).await })
        });
        let results = futures::future::join_all(calls).await;

        let mut admitted = 0;
        let mut denied = 0;
        for result in results {
            match result.unwrap() {
                Ok(true) => admitted += 1,
                Err(e) if e.is_rate_limited() => denied += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(admitted, 7);
        assert_eq!(denied, 33);
    }
}
