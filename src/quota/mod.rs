//! Per-organization resource quota enforcement.
//!
//! Many stateless API server instances take reservation decisions against
//! shared per-organization limits. The check-then-increment on the usage
//! counter is made atomic by a [`DistributedLock`] keyed per
//! (organization, region, resource type), so two concurrent requests can
//! never both read a counter below the limit and both write (the classic
//! lost-update race). Distinct triples use independent keys and proceed in
//! parallel.

pub mod lock;
pub mod store;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use lock::{
    DistributedLock, ExtendOutcome, LockConfig, LockError, LockHandle, ReleaseOutcome,
};
pub use store::{
    LockStore, MemoryLockStore, MemoryQuotaProvider, MemoryUsageStore, PgLockStore,
    PgQuotaProvider, PgUsageStore, QuotaProvider, StoreError, UsageStore,
};

use crate::organization::ResourceType;

/// Outcome of a reservation decision. `Denied` is a normal business result,
/// not a fault, and carries the numbers callers need for an actionable
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted { usage: i64 },
    Denied { current: i64, limit: i64 },
}

#[derive(Debug, Error)]
pub enum QuotaError {
    /// Rejected before any shared-state access.
    #[error("amount must be a positive integer, got {0}")]
    InvalidAmount(i64),
    /// The quota lock stayed contended for the whole wait window. Transient;
    /// no state was mutated and the request was never granted.
    #[error("quota lock {key:?} not acquired within {waited:?}")]
    LockTimeout { key: String, waited: Duration },
    /// Lock store or usage/quota store failure. `Granted` is never reported
    /// unless the final usage write succeeded.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LockError> for QuotaError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { key, waited } => Self::LockTimeout { key, waited },
            LockError::Store(err) => Self::Store(err),
        }
    }
}

/// Atomic check-and-reserve of resource capacity per organization.
#[derive(Clone)]
pub struct QuotaEnforcer {
    lock: DistributedLock,
    usage: Arc<dyn UsageStore>,
    quotas: Arc<dyn QuotaProvider>,
}

impl QuotaEnforcer {
    #[must_use]
    pub fn new(
        lock: DistributedLock,
        usage: Arc<dyn UsageStore>,
        quotas: Arc<dyn QuotaProvider>,
    ) -> Self {
        Self { lock, usage, quotas }
    }

    /// Deterministic lock key, identical across all processes.
    #[must_use]
    pub fn lock_key(organization_id: Uuid, region_id: &str, resource_type: ResourceType) -> String {
        format!("quota:{organization_id}:{region_id}:{resource_type}")
    }

    /// Reserve `amount` units of `resource_type` for an organization in a
    /// region.
    ///
    /// Acquires the per-triple lock, re-reads usage and limit, denies without
    /// mutation when `current + amount` would exceed the limit, otherwise
    /// writes the incremented counter. The lock is released on every exit
    /// path; a release that comes back `AlreadyExpired` is logged and left to
    /// the TTL.
    ///
    /// # Errors
    /// `InvalidAmount` for `amount <= 0`, `LockTimeout` when the lock stayed
    /// contended, `Store` when a store failed. None of these mutate usage.
    pub async fn reserve(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
        amount: i64,
    ) -> Result<Reservation, QuotaError> {
        if amount <= 0 {
            return Err(QuotaError::InvalidAmount(amount));
        }

        let key = Self::lock_key(organization_id, region_id, resource_type);
        let handle = self.lock.acquire(&key).await?;

        let decision = self
            .check_and_increment(organization_id, region_id, resource_type, amount)
            .await;

        self.release_quietly(&handle).await;

        decision
    }

    /// Return `amount` units of capacity, the symmetric path taken when a
    /// resource is deleted. Same lock, decrement saturating at zero.
    ///
    /// # Errors
    /// Same taxonomy as [`Self::reserve`].
    pub async fn release_capacity(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
        amount: i64,
    ) -> Result<i64, QuotaError> {
        if amount <= 0 {
            return Err(QuotaError::InvalidAmount(amount));
        }

        let key = Self::lock_key(organization_id, region_id, resource_type);
        let handle = self.lock.acquire(&key).await?;

        let result = async {
            let current = self
                .usage
                .current_usage(organization_id, region_id, resource_type)
                .await?;
            let next = (current - amount).max(0);
            self.usage
                .set_usage(organization_id, region_id, resource_type, next)
                .await?;
            Ok::<i64, QuotaError>(next)
        }
        .await;

        self.release_quietly(&handle).await;

        result
    }

    /// Best-effort usage read without taking the lock. May be stale; never
    /// use it for a grant/deny decision.
    ///
    /// # Errors
    /// `Store` when the usage store failed.
    pub async fn usage_snapshot(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
    ) -> Result<i64, QuotaError> {
        Ok(self
            .usage
            .current_usage(organization_id, region_id, resource_type)
            .await?)
    }

    async fn check_and_increment(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
        amount: i64,
    ) -> Result<Reservation, QuotaError> {
        let current = self
            .usage
            .current_usage(organization_id, region_id, resource_type)
            .await?;

        // Nothing provisioned means nothing may be consumed.
        let limit = self
            .quotas
            .region_quota(organization_id, region_id, resource_type)
            .await?
            .unwrap_or(0);

        if current + amount > limit {
            debug!(
                %organization_id,
                region_id,
                %resource_type,
                current,
                limit,
                amount,
                "reservation denied"
            );
            return Ok(Reservation::Denied { current, limit });
        }

        let next = current + amount;
        self.usage
            .set_usage(organization_id, region_id, resource_type, next)
            .await?;

        debug!(
            %organization_id,
            region_id,
            %resource_type,
            usage = next,
            limit,
            "reservation granted"
        );

        Ok(Reservation::Granted { usage: next })
    }

    async fn release_quietly(&self, handle: &LockHandle) {
        match self.lock.release(handle).await {
            Ok(ReleaseOutcome::Released) => {}
            Ok(ReleaseOutcome::AlreadyExpired) => {
                warn!(key = %handle.key(), "quota lock expired before release");
            }
            Err(err) => {
                warn!(key = %handle.key(), "failed to release quota lock: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Fixture {
        enforcer: QuotaEnforcer,
        lock_store: Arc<MemoryLockStore>,
        usage: Arc<MemoryUsageStore>,
        quotas: Arc<MemoryQuotaProvider>,
    }

    fn fixture() -> Fixture {
        let lock_store = Arc::new(MemoryLockStore::new());
        let usage = Arc::new(MemoryUsageStore::new());
        let quotas = Arc::new(MemoryQuotaProvider::new());
        let config = LockConfig {
            ttl: Duration::from_secs(5),
            max_wait: Duration::from_millis(500),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
        };
        let enforcer = QuotaEnforcer::new(
            DistributedLock::new(lock_store.clone(), config),
            usage.clone(),
            quotas.clone(),
        );
        Fixture {
            enforcer,
            lock_store,
            usage,
            quotas,
        }
    }

    #[tokio::test]
    async fn test_reserve_grants_under_limit() {
        let f = fixture();
        let org = Uuid::new_v4();
        f.quotas.set_limit(org, "eu-1", ResourceType::Sandbox, 5).await;

        let result = f
            .enforcer
            .reserve(org, "eu-1", ResourceType::Sandbox, 2)
            .await
            .unwrap();
        assert_eq!(result, Reservation::Granted { usage: 2 });
        assert_eq!(
            f.enforcer
                .usage_snapshot(org, "eu-1", ResourceType::Sandbox)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_reserve_denies_over_limit_without_mutation() {
        let f = fixture();
        let org = Uuid::new_v4();
        f.quotas.set_limit(org, "eu-1", ResourceType::Sandbox, 5).await;
        f.usage
            .set_usage(org, "eu-1", ResourceType::Sandbox, 4)
            .await
            .unwrap();

        let result = f
            .enforcer
            .reserve(org, "eu-1", ResourceType::Sandbox, 2)
            .await
            .unwrap();
        assert_eq!(result, Reservation::Denied { current: 4, limit: 5 });
        assert_eq!(
            f.usage
                .current_usage(org, "eu-1", ResourceType::Sandbox)
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_missing_quota_row_denies() {
        let f = fixture();
        let org = Uuid::new_v4();

        let result = f
            .enforcer
            .reserve(org, "eu-1", ResourceType::Snapshot, 1)
            .await
            .unwrap();
        assert_eq!(result, Reservation::Denied { current: 0, limit: 0 });
    }

    #[tokio::test]
    async fn test_non_positive_amount_fails_before_lock() {
        let f = fixture();
        let org = Uuid::new_v4();
        // a held lock would make reserve wait; the validation must fire first
        let _held = f
            .enforcer
            .lock
            .acquire(&QuotaEnforcer::lock_key(org, "eu-1", ResourceType::Sandbox))
            .await
            .unwrap();

        for amount in [0, -3] {
            let err = f
                .enforcer
                .reserve(org, "eu-1", ResourceType::Sandbox, amount)
                .await
                .unwrap_err();
            assert!(matches!(err, QuotaError::InvalidAmount(a) if a == amount));
        }
    }

    #[tokio::test]
    async fn test_lock_timeout_surfaces() {
        let f = fixture();
        let org = Uuid::new_v4();
        f.quotas.set_limit(org, "eu-1", ResourceType::Sandbox, 5).await;

        let key = QuotaEnforcer::lock_key(org, "eu-1", ResourceType::Sandbox);
        let _held = f.enforcer.lock.acquire(&key).await.unwrap();

        let err = f
            .enforcer
            .reserve(org, "eu-1", ResourceType::Sandbox, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::LockTimeout { .. }));
        assert_eq!(
            f.usage
                .current_usage(org, "eu-1", ResourceType::Sandbox)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_usage_store_failure_releases_lock() {
        let f = fixture();
        let org = Uuid::new_v4();
        f.quotas.set_limit(org, "eu-1", ResourceType::Sandbox, 5).await;
        f.usage.set_failing(true);

        let err = f
            .enforcer
            .reserve(org, "eu-1", ResourceType::Sandbox, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::Store(StoreError::Unavailable(_))));

        // the lock must not be left to the TTL
        let key = QuotaEnforcer::lock_key(org, "eu-1", ResourceType::Sandbox);
        assert!(!f.lock_store.is_held(&key).await);

        f.usage.set_failing(false);
        assert_eq!(
            f.usage
                .current_usage(org, "eu-1", ResourceType::Sandbox)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_denied_path_releases_lock() {
        let f = fixture();
        let org = Uuid::new_v4();

        f.enforcer
            .reserve(org, "eu-1", ResourceType::Volume, 1)
            .await
            .unwrap();

        let key = QuotaEnforcer::lock_key(org, "eu-1", ResourceType::Volume);
        assert!(!f.lock_store.is_held(&key).await);
    }

    #[tokio::test]
    async fn test_release_capacity_decrements_and_floors_at_zero() {
        let f = fixture();
        let org = Uuid::new_v4();
        f.usage
            .set_usage(org, "eu-1", ResourceType::Sandbox, 3)
            .await
            .unwrap();

        assert_eq!(
            f.enforcer
                .release_capacity(org, "eu-1", ResourceType::Sandbox, 2)
                .await
                .unwrap(),
            1
        );
        // double-delete style over-release must not go negative
        assert_eq!(
            f.enforcer
                .release_capacity(org, "eu-1", ResourceType::Sandbox, 5)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_lock_key_is_stable_and_distinct() {
        let org = Uuid::new_v4();
        let key = QuotaEnforcer::lock_key(org, "eu-1", ResourceType::Sandbox);
        assert_eq!(key, format!("quota:{org}:eu-1:sandbox"));
        assert_ne!(
            key,
            QuotaEnforcer::lock_key(org, "eu-1", ResourceType::Snapshot)
        );
        assert_ne!(
            key,
            QuotaEnforcer::lock_key(org, "us-1", ResourceType::Sandbox)
        );
    }
}
