//! Cluster-wide named locks.
//!
//! The Postgres implementation uses session-scoped advisory locks; the
//! connection holding a lock is parked until the matching unlock so the
//! session, and with it the lock, stays alive.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use procq_core::{SchedulerError, SchedulerResult};
use procq_domain::ports::ClusterLockService;

/// Stable 64-bit FNV-1a over the lock name. Every node must derive the
/// same key for the same name.
fn lock_key(name: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash as i64
}

pub struct PgAdvisoryLock {
    pool: PgPool,
    held: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClusterLockService for PgAdvisoryLock {
    async fn try_lock(&self, name: &str) -> SchedulerResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
            .bind(lock_key(name))
            .fetch_one(&mut *conn)
            .await?
            .try_get("locked")?;
        if acquired {
            debug!(name, "acquired cluster lock");
            self.held.lock().await.insert(name.to_string(), conn);
        }
        Ok(acquired)
    }

    async fn lock(&self, name: &str) -> SchedulerResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(lock_key(name))
            .execute(&mut *conn)
            .await?;
        debug!(name, "acquired cluster lock");
        self.held.lock().await.insert(name.to_string(), conn);
        Ok(())
    }

    async fn unlock(&self, name: &str) -> SchedulerResult<()> {
        let conn = self.held.lock().await.remove(name);
        let Some(mut conn) = conn else {
            return Err(SchedulerError::LockNotAcquired {
                name: name.to_string(),
            });
        };
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_key(name))
            .execute(&mut *conn)
            .await?;
        debug!(name, "released cluster lock");
        Ok(())
    }
}

/// In-process lock for single-node deployments and tests.
#[derive(Default)]
pub struct LocalClusterLock {
    held: Mutex<HashSet<String>>,
    released: Notify,
}

#[async_trait]
impl ClusterLockService for LocalClusterLock {
    async fn try_lock(&self, name: &str) -> SchedulerResult<bool> {
        Ok(self.held.lock().await.insert(name.to_string()))
    }

    async fn lock(&self, name: &str) -> SchedulerResult<()> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before the insert attempt so a release between the
            // failed attempt and the await is not missed.
            notified.as_mut().enable();
            if self.held.lock().await.insert(name.to_string()) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn unlock(&self, name: &str) -> SchedulerResult<()> {
        if !self.held.lock().await.remove(name) {
            return Err(SchedulerError::LockNotAcquired {
                name: name.to_string(),
            });
        }
        self.released.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable_and_distinct() {
        assert_eq!(lock_key("create-tasks"), lock_key("create-tasks"));
        assert_ne!(lock_key("create-tasks"), lock_key("task-retention"));
    }

    #[tokio::test]
    async fn local_lock_is_exclusive_per_name() {
        let lock = LocalClusterLock::default();
        assert!(lock.try_lock("a").await.unwrap());
        assert!(!lock.try_lock("a").await.unwrap());
        assert!(lock.try_lock("b").await.unwrap());

        lock.unlock("a").await.unwrap();
        assert!(lock.try_lock("a").await.unwrap());
    }

    #[tokio::test]
    async fn unlocking_without_holding_is_an_error() {
        let lock = LocalClusterLock::default();
        assert!(lock.unlock("a").await.is_err());
    }

    #[tokio::test]
    async fn blocking_lock_waits_for_release() {
        let lock = std::sync::Arc::new(LocalClusterLock::default());
        lock.lock("a").await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.lock("a").await.unwrap();
                lock.unlock("a").await.unwrap();
            })
        };

        lock.unlock("a").await.unwrap();
        waiter.await.unwrap();
    }
}
