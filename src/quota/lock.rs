//! Distributed lock over a shared expiring key-value store.
//!
//! Any number of API server processes can contend for the same key; the
//! store's atomic "set if absent or expired" gives mutual exclusion, the TTL
//! gives liveness when a holder crashes, and the per-acquisition ownership
//! token keeps a slow holder from releasing a lock that has since moved on.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

use crate::quota::store::{LockStore, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held by others for the whole `max_wait` window.
    /// Transient: nothing was mutated and the caller may retry.
    #[error("lock {key:?} not acquired within {waited:?}")]
    Timeout { key: String, waited: Duration },
    /// The lock store itself failed. Not retried here; the caller owns the
    /// retry policy for the whole request.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tunables for lock acquisition.
///
/// `ttl` must exceed the worst-case duration of the protected critical
/// section by a safety margin, otherwise a healthy holder can lose the lock
/// mid-section. `max_wait` bounds caller-visible latency.
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub ttl: Duration,
    pub max_wait: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_wait: Duration::from_secs(10),
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(1),
        }
    }
}

/// A held lock: key, ownership token and the local expiry estimate.
///
/// The token is a fresh ULID per acquisition and is never reused, so it
/// doubles as a fencing token for downstream writes.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: String,
    deadline: Instant,
}

impl LockHandle {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Local estimate only; the store's clock is authoritative.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The stored token no longer matched: the TTL fired and someone else
    /// may already hold the key. Nothing was deleted.
    AlreadyExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended,
    AlreadyExpired,
}

/// Mutual exclusion for named keys across independent processes.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl DistributedLock {
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire `key`, retrying with randomized exponential backoff until
    /// `max_wait` elapses.
    ///
    /// The loop holds no partial state between attempts, so dropping the
    /// future while it waits leaves the store untouched.
    ///
    /// # Errors
    /// `LockError::Timeout` when the key stayed held for the whole window,
    /// `LockError::Store` when the store failed.
    pub async fn acquire(&self, key: &str) -> Result<LockHandle, LockError> {
        let token = Ulid::new().to_string();
        let started = Instant::now();
        let mut backoff = self.config.backoff_base;

        loop {
            if self
                .store
                .try_acquire(key, &token, self.config.ttl)
                .await?
            {
                debug!(key, "lock acquired");
                return Ok(LockHandle {
                    key: key.to_string(),
                    token,
                    deadline: Instant::now() + self.config.ttl,
                });
            }

            let waited = started.elapsed();
            if waited >= self.config.max_wait {
                debug!(key, ?waited, "lock acquisition timed out");
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited,
                });
            }

            // Additive jitter keeps concurrent waiters from retrying in step.
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2 + 1);
            let remaining = self.config.max_wait - waited;
            let sleep = (backoff + Duration::from_millis(jitter)).min(remaining);
            tokio::time::sleep(sleep).await;

            backoff = (backoff * 2).min(self.config.backoff_cap);
        }
    }

    /// Compare-and-delete release. `AlreadyExpired` is informational, not an
    /// error: the TTL already guarantees the key will not stay held.
    ///
    /// # Errors
    /// `LockError::Store` when the store failed.
    pub async fn release(&self, handle: &LockHandle) -> Result<ReleaseOutcome, LockError> {
        if self.store.release(&handle.key, &handle.token).await? {
            debug!(key = %handle.key, "lock released");
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::AlreadyExpired)
        }
    }

    /// Push the expiry out by `additional_ttl` for a long critical section.
    ///
    /// # Errors
    /// `LockError::Store` when the store failed.
    pub async fn extend(
        &self,
        handle: &mut LockHandle,
        additional_ttl: Duration,
    ) -> Result<ExtendOutcome, LockError> {
        if self
            .store
            .extend(&handle.key, &handle.token, additional_ttl)
            .await?
        {
            handle.deadline += additional_ttl;
            Ok(ExtendOutcome::Extended)
        } else {
            Ok(ExtendOutcome::AlreadyExpired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::store::MemoryLockStore;

    fn fast_config() -> LockConfig {
        LockConfig {
            ttl: Duration::from_secs(5),
            max_wait: Duration::from_millis(200),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_acquire_then_release_leaves_key_absent() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::new(store.clone(), fast_config());

        let handle = lock.acquire("quota:org:eu-1:sandbox").await.unwrap();
        assert!(!handle.is_expired());
        assert_eq!(
            lock.release(&handle).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert!(!store.is_held("quota:org:eu-1:sandbox").await);
    }

    #[tokio::test]
    async fn test_tokens_differ_across_acquisitions() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::new(store, fast_config());

        let first = lock.acquire("k").await.unwrap();
        let first_token = first.token().to_string();
        lock.release(&first).await.unwrap();

        let second = lock.acquire("k").await.unwrap();
        assert_ne!(first_token, second.token());
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::new(store, fast_config());

        let _held = lock.acquire("k").await.unwrap();
        let err = lock.acquire("k").await.unwrap_err();
        match err {
            LockError::Timeout { key, waited } => {
                assert_eq!(key, "k");
                assert!(waited >= Duration::from_millis(200));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::new(
            store,
            LockConfig {
                max_wait: Duration::from_secs(5),
                ..fast_config()
            },
        );

        let held = lock.acquire("k").await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("k").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.release(&held).await.unwrap();

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.key(), "k");
    }

    #[tokio::test]
    async fn test_stale_release_does_not_delete_new_holder() {
        let store = Arc::new(MemoryLockStore::new());
        // Zero TTL: the entry expires as soon as it is written.
        let expiring = DistributedLock::new(
            store.clone(),
            LockConfig {
                ttl: Duration::ZERO,
                ..fast_config()
            },
        );
        let lock = DistributedLock::new(store.clone(), fast_config());

        let stale = expiring.acquire("k").await.unwrap();
        let fresh = lock.acquire("k").await.unwrap();

        assert_eq!(
            expiring.release(&stale).await.unwrap(),
            ReleaseOutcome::AlreadyExpired
        );
        assert!(store.is_held("k").await);

        assert_eq!(lock.release(&fresh).await.unwrap(), ReleaseOutcome::Released);
    }

    #[tokio::test]
    async fn test_extend_requires_live_token() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::new(store.clone(), fast_config());

        let mut handle = lock.acquire("k").await.unwrap();
        assert_eq!(
            lock.extend(&mut handle, Duration::from_secs(5))
                .await
                .unwrap(),
            ExtendOutcome::Extended
        );

        lock.release(&handle).await.unwrap();
        assert_eq!(
            lock.extend(&mut handle, Duration::from_secs(5))
                .await
                .unwrap(),
            ExtendOutcome::AlreadyExpired
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_timeout() {
        let store = Arc::new(MemoryLockStore::new());
        store.set_failing(true);
        let lock = DistributedLock::new(store, fast_config());

        let err = lock.acquire("k").await.unwrap_err();
        assert!(matches!(err, LockError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let store = Arc::new(MemoryLockStore::new());
        let lock = DistributedLock::new(store, fast_config());

        let a = lock.acquire("quota:org:eu-1:sandbox").await.unwrap();
        // would time out if keys shared a lock
        let b = lock.acquire("quota:org:eu-1:volume").await.unwrap();

        lock.release(&a).await.unwrap();
        lock.release(&b).await.unwrap();
    }
}
