use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use procq_core::SchedulerResult;
use procq_domain::clock::now_ms;
use procq_domain::repositories::{ChangeStatusResult, ProcessorTaskRepository};
use procq_domain::{NodeRef, ProcessorTask, TaskStatus};

const TASK_COLUMNS: &str =
    "id, version, filter_id, stream_id, data, node_name, status, create_ms, status_ms, \
     start_time_ms, end_time_ms";

pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn row_to_task(row: &sqlx::postgres::PgRow) -> SchedulerResult<ProcessorTask> {
    let status: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status).ok_or_else(|| {
        procq_core::SchedulerError::DatabaseOperation(format!("unknown task status '{status}'"))
    })?;

    Ok(ProcessorTask {
        id: row.try_get("id")?,
        version: row.try_get("version")?,
        filter_id: row.try_get("filter_id")?,
        stream_id: row.try_get("stream_id")?,
        data: row.try_get("data")?,
        node_name: row.try_get("node_name")?,
        status,
        create_ms: row.try_get("create_ms")?,
        status_ms: row.try_get("status_ms")?,
        start_time_ms: row.try_get("start_time_ms")?,
        end_time_ms: row.try_get("end_time_ms")?,
    })
}

#[async_trait]
impl ProcessorTaskRepository for PgTaskRepository {
    #[instrument(skip(self))]
    async fn load(&self, id: i64) -> SchedulerResult<Option<ProcessorTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM processor_task WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn find_unowned_unlocked(
        &self,
        filter_id: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<ProcessorTask>> {
        let rows = sqlx::query(
            "SELECT t.id, t.version, t.filter_id, t.stream_id, t.data, t.node_name, \
             t.status, t.create_ms, t.status_ms, t.start_time_ms, t.end_time_ms \
             FROM processor_task t \
             JOIN stream_meta s ON s.id = t.stream_id \
             WHERE t.filter_id = $1 AND t.status = 'UNPROCESSED' \
             AND t.node_name IS NULL AND s.status = 'UNLOCKED' \
             ORDER BY t.id LIMIT $2",
        )
        .bind(filter_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Optimistic update keyed on the version column. A missed update is
    /// disambiguated into not-found versus concurrent-change so the caller
    /// can decide whether to retry.
    async fn change_status(
        &self,
        task_id: i64,
        version: i32,
        node: Option<&NodeRef>,
        status: TaskStatus,
    ) -> SchedulerResult<ChangeStatusResult> {
        let row = sqlx::query(&format!(
            "UPDATE processor_task SET \
             version = version + 1, node_name = $3, status = $4, status_ms = $5 \
             WHERE id = $1 AND version = $2 \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id)
        .bind(version)
        .bind(node.map(|n| n.name.as_str()))
        .bind(status.as_str())
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(ChangeStatusResult::Updated(row_to_task(&row)?));
        }

        let exists = sqlx::query("SELECT 1 FROM processor_task WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            debug!(task_id, version, "task version conflict");
            Ok(ChangeStatusResult::Conflict)
        } else {
            Ok(ChangeStatusResult::NotFound)
        }
    }

    #[instrument(skip(self), fields(node = %node.name))]
    async fn release_owned_by(&self, node: &NodeRef) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE processor_task SET \
             version = version + 1, node_name = NULL, status = 'UNPROCESSED', status_ms = $2 \
             WHERE node_name = $1 AND status IN ('UNPROCESSED', 'ASSIGNED')",
        )
        .bind(&node.name)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
