//! Physical deletion of finished tasks and their spent filters.
//!
//! Runs on whichever node wins the retention lock; everyone else skips
//! the round. Ids are staged into a helper table so each delete batch is
//! a plain join, keeping row locks short on a busy task table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info, warn};

use procq_core::config::RetentionConfig;
use procq_core::SchedulerResult;
use procq_domain::clock::now_ms;
use procq_domain::ports::ClusterLockService;
use procq_domain::repositories::ProcessorFilterRepository;

/// Cluster-wide name guarding retention deletes.
pub const RETENTION_LOCK: &str = "task-retention";

pub struct TaskRetentionExecutor {
    pool: PgPool,
    lock_service: Arc<dyn ClusterLockService>,
    filter_repo: Arc<dyn ProcessorFilterRepository>,
    config: RetentionConfig,
    interrupted: AtomicBool,
}

impl TaskRetentionExecutor {
    pub fn new(
        pool: PgPool,
        lock_service: Arc<dyn ClusterLockService>,
        filter_repo: Arc<dyn ProcessorFilterRepository>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            pool,
            lock_service,
            filter_repo,
            config,
            interrupted: AtomicBool::new(false),
        }
    }

    /// Ask a running pass to stop at the next batch boundary. A half-staged
    /// batch is picked up by the leftover recovery on the next run.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub async fn exec(&self) -> SchedulerResult<()> {
        self.interrupted.store(false, Ordering::Release);
        if !self.lock_service.try_lock(RETENTION_LOCK).await? {
            debug!("another node is running retention, skipping");
            return Ok(());
        }
        let result = self.run().await;
        if let Err(e) = self.lock_service.unlock(RETENTION_LOCK).await {
            warn!("failed to release {RETENTION_LOCK} lock: {e}");
        }
        result
    }

    async fn run(&self) -> SchedulerResult<()> {
        let threshold_ms = delete_threshold_ms(now_ms(), self.config.delete_age_duration());
        self.delete_old_tasks(threshold_ms).await?;
        self.delete_old_filters(threshold_ms).await?;
        Ok(())
    }

    /// Delete finished tasks created before the threshold, in bounded
    /// batches staged through `deleting_task_id`.
    async fn delete_old_tasks(&self, threshold_ms: i64) -> SchedulerResult<()> {
        let mut stager = PgDeleteStager {
            conn: self.pool.acquire().await?,
        };
        let total = run_delete_batches(
            &mut stager,
            threshold_ms,
            self.config.delete_batch_size as i64,
            &self.interrupted,
        )
        .await?;

        if total > 0 {
            info!(deleted = total, threshold_ms, "deleted old tasks");
        }
        Ok(())
    }

    /// Second pass: complete filters not polled since the threshold. A
    /// filter whose tasks have not all been deleted yet fails on the
    /// foreign key and is retried next round.
    async fn delete_old_filters(&self, threshold_ms: i64) -> SchedulerResult<()> {
        let mut deleted = 0u64;
        for filter_id in self.filter_repo.find_deletable(threshold_ms).await? {
            if self.is_interrupted() {
                break;
            }
            match self.filter_repo.delete(filter_id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => debug!(filter_id, "filter still referenced, keeping: {e}"),
            }
        }
        if deleted > 0 {
            info!(deleted, "deleted spent filters");
        }
        Ok(())
    }
}

fn delete_threshold_ms(now_ms: i64, delete_age: Duration) -> i64 {
    now_ms - delete_age.as_millis() as i64
}

/// Staging operations of one delete pass, split out from the loop so the
/// batch and recovery behavior can be driven without a database.
#[async_trait]
trait DeleteStager: Send {
    /// Rows already sitting in the staging table.
    async fn leftover_count(&mut self) -> SchedulerResult<i64>;
    /// Stage up to `limit` deletable rows older than the threshold,
    /// returning how many were staged.
    async fn stage(&mut self, threshold_ms: i64, limit: i64) -> SchedulerResult<u64>;
    /// Delete the staged rows from the target table and empty the stage.
    async fn delete_staged(&mut self) -> SchedulerResult<()>;
}

struct PgDeleteStager {
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl DeleteStager for PgDeleteStager {
    async fn leftover_count(&mut self) -> SchedulerResult<i64> {
        let n = sqlx::query("SELECT COUNT(*) AS n FROM deleting_task_id")
            .fetch_one(&mut *self.conn)
            .await?
            .try_get("n")?;
        Ok(n)
    }

    async fn stage(&mut self, threshold_ms: i64, limit: i64) -> SchedulerResult<u64> {
        let staged = sqlx::query(
            "INSERT INTO deleting_task_id (id) \
             SELECT id FROM processor_task \
             WHERE status IN ('COMPLETE', 'FAILED', 'DELETED') AND create_ms < $1 \
             LIMIT $2",
        )
        .bind(threshold_ms)
        .bind(limit)
        .execute(&mut *self.conn)
        .await?
        .rows_affected();
        Ok(staged)
    }

    async fn delete_staged(&mut self) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM processor_task t USING deleting_task_id d WHERE t.id = d.id")
            .execute(&mut *self.conn)
            .await?;
        sqlx::query("TRUNCATE deleting_task_id")
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

async fn run_delete_batches(
    stager: &mut dyn DeleteStager,
    threshold_ms: i64,
    batch_size: i64,
    interrupted: &AtomicBool,
) -> SchedulerResult<u64> {
    // Ids left behind by an interrupted run still need their delete.
    let leftover = stager.leftover_count().await?;
    if leftover > 0 {
        warn!(leftover, "recovering interrupted retention batch");
        stager.delete_staged().await?;
    }

    let mut total = 0u64;
    loop {
        if interrupted.load(Ordering::Acquire) {
            info!("retention interrupted, stopping after current batch");
            break;
        }
        let staged = stager.stage(threshold_ms, batch_size).await?;
        if staged == 0 {
            break;
        }
        stager.delete_staged().await?;
        total += staged;
        if (staged as i64) < batch_size {
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InMemoryStager {
        candidates: Vec<(i64, i64)>,
        staged: Vec<i64>,
        deleted: Vec<i64>,
        stage_sizes: Vec<u64>,
        interrupt_after_delete: Option<Arc<AtomicBool>>,
    }

    impl InMemoryStager {
        fn new(candidates: &[(i64, i64)]) -> Self {
            Self {
                candidates: candidates.to_vec(),
                staged: Vec::new(),
                deleted: Vec::new(),
                stage_sizes: Vec::new(),
                interrupt_after_delete: None,
            }
        }
    }

    #[async_trait]
    impl DeleteStager for InMemoryStager {
        async fn leftover_count(&mut self) -> SchedulerResult<i64> {
            Ok(self.staged.len() as i64)
        }

        async fn stage(&mut self, threshold_ms: i64, limit: i64) -> SchedulerResult<u64> {
            let take: Vec<i64> = self
                .candidates
                .iter()
                .filter(|(_, create_ms)| *create_ms < threshold_ms)
                .take(limit as usize)
                .map(|(id, _)| *id)
                .collect();
            self.candidates.retain(|(id, _)| !take.contains(id));
            self.stage_sizes.push(take.len() as u64);
            let staged = take.len() as u64;
            self.staged.extend(take);
            Ok(staged)
        }

        async fn delete_staged(&mut self) -> SchedulerResult<()> {
            self.deleted.extend(self.staged.drain(..));
            if let Some(flag) = &self.interrupt_after_delete {
                flag.store(true, Ordering::Release);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn five_rows_with_batch_size_two_take_three_batches() {
        let mut stager = InMemoryStager::new(&[(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)]);
        let interrupted = AtomicBool::new(false);

        let total = run_delete_batches(&mut stager, 100, 2, &interrupted)
            .await
            .unwrap();

        assert_eq!(total, 5);
        assert_eq!(stager.stage_sizes, vec![2, 2, 1]);
        assert!(stager.staged.is_empty());
        assert_eq!(stager.deleted, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn rows_newer_than_the_threshold_are_kept() {
        let mut stager = InMemoryStager::new(&[(1, 50), (2, 150)]);
        let interrupted = AtomicBool::new(false);

        let total = run_delete_batches(&mut stager, 100, 10, &interrupted)
            .await
            .unwrap();

        assert_eq!(total, 1);
        assert_eq!(stager.deleted, vec![1]);
        assert_eq!(stager.candidates, vec![(2, 150)]);
    }

    #[tokio::test]
    async fn leftover_batch_from_crashed_run_is_deleted_first() {
        let mut stager = InMemoryStager::new(&[(3, 0)]);
        stager.staged = vec![1, 2];
        let interrupted = AtomicBool::new(false);

        let total = run_delete_batches(&mut stager, 100, 2, &interrupted)
            .await
            .unwrap();

        // Recovered ids are deleted but not counted against this run.
        assert_eq!(total, 1);
        assert_eq!(stager.deleted, vec![1, 2, 3]);
        assert!(stager.staged.is_empty());
    }

    #[tokio::test]
    async fn interrupt_stops_at_the_batch_boundary() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut stager = InMemoryStager::new(&[(1, 0), (2, 0), (3, 0), (4, 0)]);
        stager.interrupt_after_delete = Some(flag.clone());

        let total = run_delete_batches(&mut stager, 100, 2, flag.as_ref())
            .await
            .unwrap();

        assert_eq!(total, 2);
        assert_eq!(stager.deleted, vec![1, 2]);
        assert_eq!(stager.candidates.len(), 2);
    }

    #[test]
    fn threshold_is_now_minus_the_delete_age() {
        assert_eq!(
            delete_threshold_ms(1_000_000, Duration::from_secs(60)),
            940_000
        );
    }
}
