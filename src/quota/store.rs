//! Storage seams for the quota subsystem.
//!
//! Three narrow traits keep the enforcer independent of where the shared
//! state lives: [`LockStore`] (expiring lock keys), [`UsageStore`] (live
//! resource counters) and [`QuotaProvider`] (configured limits). Postgres
//! implementations back the service; the in-memory ones back tests and
//! embedders.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::organization::ResourceType;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Shared key-value store with expiring keys, the serialization primitive
/// behind [`crate::quota::DistributedLock`].
///
/// Implementations must make each operation atomic with respect to
/// concurrent callers in other processes. None of them retries internally;
/// unavailability surfaces as [`StoreError`] and the caller owns the retry
/// policy.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store `token` under `key` with expiry `now + ttl`, only if the key is
    /// absent or its previous holder's entry has expired. Returns whether the
    /// caller now holds the key.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Compare-and-delete: remove `key` only if it still stores `token`.
    /// Returns whether a deletion happened.
    async fn release(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    /// Compare-and-extend: push the expiry of `key` out by `additional_ttl`
    /// only if it still stores `token` and has not expired.
    async fn extend(&self, key: &str, token: &str, additional_ttl: Duration)
        -> Result<bool, StoreError>;
}

/// Live resource counters per (organization, region, resource type).
///
/// The enforcer only calls these while holding the corresponding lock; any
/// read taken outside a lock is diagnostic and may be stale.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Current counter value; a counter that was never written reads as zero.
    async fn current_usage(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
    ) -> Result<i64, StoreError>;

    async fn set_usage(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
        value: i64,
    ) -> Result<(), StoreError>;
}

/// Configured region quota limits. Administrative mutation happens elsewhere.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    /// The configured limit, or `None` when nothing was provisioned for this
    /// triple.
    async fn region_quota(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
    ) -> Result<Option<i64>, StoreError>;
}

/// Creates the tables the Postgres stores rely on. Safe to run on every
/// startup.
///
/// # Errors
/// Returns `StoreError` when a statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resource_locks (
            key        TEXT PRIMARY KEY,
            token      TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_counters (
            organization_id UUID NOT NULL,
            region_id       TEXT NOT NULL,
            resource_type   TEXT NOT NULL,
            used            BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (organization_id, region_id, resource_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS region_quotas (
            organization_id UUID NOT NULL,
            region_id       TEXT NOT NULL,
            resource_type   TEXT NOT NULL,
            quota_limit     BIGINT NOT NULL,
            PRIMARY KEY (organization_id, region_id, resource_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// [`LockStore`] on the service's Postgres. Each operation is a single
/// statement, so atomicity comes from the database and holds across any
/// number of API server processes.
#[derive(Debug, Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        // The upsert only overwrites an expired entry; a live holder makes
        // the WHERE clause fail and no row is affected.
        let result = sqlx::query(
            r#"
            INSERT INTO resource_locks (key, token, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
            WHERE resource_locks.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM resource_locks WHERE key = $1 AND token = $2")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn extend(
        &self,
        key: &str,
        token: &str,
        additional_ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE resource_locks
            SET expires_at = expires_at + make_interval(secs => $3)
            WHERE key = $1 AND token = $2 AND expires_at > now()
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(additional_ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// [`UsageStore`] on Postgres.
#[derive(Debug, Clone)]
pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn current_usage(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
    ) -> Result<i64, StoreError> {
        let used: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT used FROM usage_counters
            WHERE organization_id = $1 AND region_id = $2 AND resource_type = $3
            "#,
        )
        .bind(organization_id)
        .bind(region_id)
        .bind(resource_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(used.map_or(0, |(value,)| value))
    }

    async fn set_usage(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
        value: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO usage_counters (organization_id, region_id, resource_type, used)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (organization_id, region_id, resource_type)
            DO UPDATE SET used = EXCLUDED.used
            "#,
        )
        .bind(organization_id)
        .bind(region_id)
        .bind(resource_type.as_str())
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// [`QuotaProvider`] on Postgres.
#[derive(Debug, Clone)]
pub struct PgQuotaProvider {
    pool: PgPool,
}

impl PgQuotaProvider {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaProvider for PgQuotaProvider {
    async fn region_quota(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
    ) -> Result<Option<i64>, StoreError> {
        let limit: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT quota_limit FROM region_quotas
            WHERE organization_id = $1 AND region_id = $2 AND resource_type = $3
            "#,
        )
        .bind(organization_id)
        .bind(region_id)
        .bind(resource_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(limit.map(|(value,)| value))
    }
}

/// In-memory [`LockStore`] with the same expiry semantics as the Postgres
/// one. Single-process only; used by tests and lightweight embedders.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    failing: AtomicBool,
}

impl MemoryLockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, simulating an unreachable store.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lock store offline".to_string()));
        }
        Ok(())
    }

    /// Diagnostic: whether `key` currently holds an unexpired entry.
    pub async fn is_held(&self, key: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(|(_, deadline)| *deadline > Instant::now())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match entries.get(key) {
            Some((_, deadline)) if *deadline > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some((stored, _)) if stored == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(
        &self,
        key: &str,
        token: &str,
        additional_ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match entries.get_mut(key) {
            Some((stored, deadline)) if stored == token && *deadline > now => {
                *deadline += additional_ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-memory [`UsageStore`] with a fault-injection switch for read/write
/// failure scenarios.
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    counters: Mutex<HashMap<(Uuid, String, ResourceType), i64>>,
    failing: AtomicBool,
}

impl MemoryUsageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("usage store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn current_usage(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
    ) -> Result<i64, StoreError> {
        self.check_available()?;
        Ok(*self
            .counters
            .lock()
            .await
            .get(&(organization_id, region_id.to_string(), resource_type))
            .unwrap_or(&0))
    }

    async fn set_usage(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
        value: i64,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.counters
            .lock()
            .await
            .insert((organization_id, region_id.to_string(), resource_type), value);
        Ok(())
    }
}

/// In-memory [`QuotaProvider`] populated by tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryQuotaProvider {
    limits: Mutex<HashMap<(Uuid, String, ResourceType), i64>>,
}

impl MemoryQuotaProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_limit(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
        limit: i64,
    ) {
        self.limits
            .lock()
            .await
            .insert((organization_id, region_id.to_string(), resource_type), limit);
    }
}

#[async_trait]
impl QuotaProvider for MemoryQuotaProvider {
    async fn region_quota(
        &self,
        organization_id: Uuid,
        region_id: &str,
        resource_type: ResourceType,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .limits
            .lock()
            .await
            .get(&(organization_id, region_id.to_string(), resource_type))
            .copied())
    }
}
