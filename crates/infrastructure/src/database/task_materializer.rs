//! Transactional task materialization under the cluster-wide create lock.
//!
//! One call inserts a task row per candidate stream, reads the rows back
//! to verify the insert, advances the tracker cursor and commits all of
//! it atomically. Any error rolls the whole round back; the unchanged
//! tracker means the next cycle simply retries the same window.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};

use procq_core::{SchedulerError, SchedulerResult};
use procq_domain::clock::now_ms;
use procq_domain::ports::{ClusterLockService, StreamTaskCandidate, TaskMaterializer};
use procq_domain::tracker_advance::{advance_tracker, CreationSummary};
use procq_domain::{
    CreatedTasks, FilterTracker, InclusiveRange, NodeRef, ProcessorFilter, StreamStatus,
    TaskStatus,
};

use super::batch_insert::{BatchRowInserter, SqlValue};
use super::task_repository::row_to_task;

/// Cluster-wide name guarding all task creation.
pub const CREATE_TASKS_LOCK: &str = "create-tasks";

pub struct PgTaskMaterializer {
    pool: PgPool,
    lock_service: Arc<dyn ClusterLockService>,
    inserter: BatchRowInserter,
}

impl PgTaskMaterializer {
    pub fn new(pool: PgPool, lock_service: Arc<dyn ClusterLockService>) -> Self {
        let inserter = BatchRowInserter::new(
            "processor_task",
            &[
                "version",
                "filter_id",
                "stream_id",
                "data",
                "node_name",
                "status",
                "create_ms",
                "status_ms",
            ],
        );
        Self {
            pool,
            lock_service,
            inserter,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_locked(
        &self,
        filter: &ProcessorFilter,
        tracker: &FilterTracker,
        query_time_ms: i64,
        candidates: Vec<StreamTaskCandidate>,
        node: &NodeRef,
        max_stream_id: Option<i64>,
    ) -> SchedulerResult<CreatedTasks> {
        let create_ms = now_ms();
        let mut summary = CreationSummary::default();
        let mut rows = Vec::new();
        let mut greatest: Option<(i64, Option<InclusiveRange>)> = None;

        for (meta, ranges) in &candidates {
            if meta.status == StreamStatus::Deleted {
                continue;
            }
            // Only unlocked streams get an owner; tasks for locked streams
            // stay unowned until a later fill finds the stream unlocked.
            let owner = (meta.status == StreamStatus::Unlocked).then(|| node.name.clone());

            rows.push(vec![
                SqlValue::I32(1),
                SqlValue::I64(filter.id),
                SqlValue::I64(meta.id),
                SqlValue::OptText(ranges.as_ref().map(|r| r.ranges_to_string())),
                SqlValue::OptText(owner),
                SqlValue::Text(TaskStatus::Unprocessed.as_str().to_string()),
                SqlValue::I64(create_ms),
                SqlValue::I64(create_ms),
            ]);

            summary.total_created += 1;
            summary.stream_id_range =
                Some(InclusiveRange::extend(summary.stream_id_range, meta.id));
            summary.stream_ms_range =
                Some(InclusiveRange::extend(summary.stream_ms_range, meta.create_ms));
            if let Some(ranges) = ranges {
                summary.event_count += ranges.count();
            }
            if greatest.as_ref().map(|(id, _)| meta.id > *id).unwrap_or(true) {
                greatest = Some((meta.id, ranges.as_ref().and_then(|r| r.outer_range())));
            }
        }

        // The greatest stream may still have events past this round's
        // range, so the cursor must stay on it rather than move past.
        summary.event_id_range = greatest.and_then(|(_, outer)| outer);

        let mut tx = self.pool.begin().await?;
        let mut available = Vec::new();

        if !rows.is_empty() {
            let ids = self.inserter.insert_returning(&mut tx, &rows).await?;
            if ids.len() != rows.len() {
                return Err(SchedulerError::TaskSelectBackMismatch {
                    expected: rows.len(),
                    actual: ids.len(),
                });
            }

            // Read the rows back through the same transaction; a mismatch
            // means the store did not persist what we asked for and the
            // whole round must roll back.
            let selected = sqlx::query(
                "SELECT id, version, filter_id, stream_id, data, node_name, status, \
                 create_ms, status_ms, start_time_ms, end_time_ms \
                 FROM processor_task WHERE id = ANY($1) ORDER BY id",
            )
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await?;
            if selected.len() != ids.len() {
                return Err(SchedulerError::TaskSelectBackMismatch {
                    expected: ids.len(),
                    actual: selected.len(),
                });
            }

            for row in &selected {
                let task = row_to_task(row)?;
                if task.node_name.as_deref() == Some(node.name.as_str()) {
                    summary.available_created += 1;
                    available.push(task);
                }
            }
        }

        let mut tracker = tracker.clone();
        advance_tracker(&mut tracker, &summary, query_time_ms, create_ms, max_stream_id);
        update_tracker(&mut tx, &tracker).await?;

        tx.commit().await?;

        debug!(
            filter_id = filter.id,
            total = summary.total_created,
            available = summary.available_created,
            events = summary.event_count,
            "materialized tasks"
        );

        Ok(CreatedTasks {
            available_count: available.len(),
            total_count: summary.total_created,
            event_count: summary.event_count,
            available,
        })
    }
}

async fn update_tracker(
    tx: &mut Transaction<'_, Postgres>,
    tracker: &FilterTracker,
) -> SchedulerResult<()> {
    sqlx::query(
        "UPDATE filter_tracker SET \
         min_stream_id = $2, min_event_id = $3, min_stream_create_ms = $4, \
         stream_create_ms = $5, max_stream_create_ms = $6, stream_count = $7, \
         event_count = $8, last_poll_ms = $9, last_poll_task_count = $10, \
         state = $11, last_message = $12 \
         WHERE id = $1",
    )
    .bind(tracker.id)
    .bind(tracker.min_stream_id)
    .bind(tracker.min_event_id)
    .bind(tracker.min_stream_create_ms)
    .bind(tracker.stream_create_ms)
    .bind(tracker.max_stream_create_ms)
    .bind(tracker.stream_count)
    .bind(tracker.event_count)
    .bind(tracker.last_poll_ms)
    .bind(tracker.last_poll_task_count)
    .bind(tracker.state.as_str())
    .bind(tracker.last_message.as_deref())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl TaskMaterializer for PgTaskMaterializer {
    #[instrument(skip_all, fields(filter_id = filter.id))]
    async fn create_new_tasks(
        &self,
        filter: &ProcessorFilter,
        tracker: &FilterTracker,
        query_time_ms: i64,
        candidates: Vec<StreamTaskCandidate>,
        node: &NodeRef,
        max_stream_id: Option<i64>,
    ) -> SchedulerResult<CreatedTasks> {
        self.lock_service.lock(CREATE_TASKS_LOCK).await?;
        let result = self
            .create_locked(filter, tracker, query_time_ms, candidates, node, max_stream_id)
            .await;
        if let Err(e) = self.lock_service.unlock(CREATE_TASKS_LOCK).await {
            error!("failed to release {CREATE_TASKS_LOCK} lock: {e}");
        }
        result
    }
}
