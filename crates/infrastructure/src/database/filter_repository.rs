use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use procq_core::{SchedulerError, SchedulerResult};
use procq_domain::repositories::ProcessorFilterRepository;
use procq_domain::{FilterTracker, Processor, ProcessorFilter, TrackerState};

const FILTER_SELECT: &str = "SELECT f.id, f.priority, f.enabled, f.create_user, f.create_ms, f.query_data, \
     p.id AS processor_id, p.pipeline, p.enabled AS processor_enabled, \
     t.id AS tracker_id, t.filter_id, t.min_stream_id, t.min_event_id, \
     t.min_stream_create_ms, t.stream_create_ms, t.max_stream_create_ms, \
     t.stream_count, t.event_count, t.last_poll_ms, t.last_poll_task_count, \
     t.state, t.last_message \
     FROM processor_filter f \
     JOIN processor p ON p.id = f.processor_id \
     JOIN filter_tracker t ON t.filter_id = f.id";

pub struct PgFilterRepository {
    pool: PgPool,
}

impl PgFilterRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_filter(row: &sqlx::postgres::PgRow) -> SchedulerResult<ProcessorFilter> {
        let query_data: serde_json::Value = row.try_get("query_data")?;
        let query_data = serde_json::from_value(query_data).map_err(|e| {
            SchedulerError::DatabaseOperation(format!("invalid query data: {e}"))
        })?;

        Ok(ProcessorFilter {
            id: row.try_get("id")?,
            processor: Processor {
                id: row.try_get("processor_id")?,
                pipeline: row.try_get("pipeline")?,
                enabled: row.try_get("processor_enabled")?,
            },
            query_data,
            priority: row.try_get("priority")?,
            enabled: row.try_get("enabled")?,
            create_user: row.try_get("create_user")?,
            create_ms: row.try_get("create_ms")?,
            tracker: Self::row_to_tracker(row)?,
        })
    }

    fn row_to_tracker(row: &sqlx::postgres::PgRow) -> SchedulerResult<FilterTracker> {
        let state: String = row.try_get("state")?;
        let state = TrackerState::parse(&state).ok_or_else(|| {
            SchedulerError::DatabaseOperation(format!("unknown tracker state '{state}'"))
        })?;

        Ok(FilterTracker {
            id: row.try_get("tracker_id")?,
            filter_id: row.try_get("filter_id")?,
            min_stream_id: row.try_get("min_stream_id")?,
            min_event_id: row.try_get("min_event_id")?,
            min_stream_create_ms: row.try_get("min_stream_create_ms")?,
            stream_create_ms: row.try_get("stream_create_ms")?,
            max_stream_create_ms: row.try_get("max_stream_create_ms")?,
            stream_count: row.try_get("stream_count")?,
            event_count: row.try_get("event_count")?,
            last_poll_ms: row.try_get("last_poll_ms")?,
            last_poll_task_count: row.try_get("last_poll_task_count")?,
            state,
            last_message: row.try_get("last_message")?,
        })
    }
}

#[async_trait]
impl ProcessorFilterRepository for PgFilterRepository {
    async fn find_enabled(&self) -> SchedulerResult<Vec<ProcessorFilter>> {
        let rows = sqlx::query(&format!(
            "{FILTER_SELECT} WHERE f.enabled AND p.enabled ORDER BY f.id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let filters = rows
            .iter()
            .map(Self::row_to_filter)
            .collect::<SchedulerResult<Vec<_>>>()?;
        debug!(count = filters.len(), "loaded enabled filters");
        Ok(filters)
    }

    #[instrument(skip(self))]
    async fn load(&self, id: i64) -> SchedulerResult<Option<ProcessorFilter>> {
        let row = sqlx::query(&format!("{FILTER_SELECT} WHERE f.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_filter).transpose()
    }

    #[instrument(skip(self, tracker), fields(filter_id = tracker.filter_id))]
    async fn save_tracker(&self, tracker: &FilterTracker) -> SchedulerResult<FilterTracker> {
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
        .execute(&self.pool)
        .await?;
        Ok(tracker.clone())
    }

    /// Tasks referencing the filter make the delete fail on the foreign
    /// key, which is the intended guard.
    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM processor_filter WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_deletable(&self, older_than_ms: i64) -> SchedulerResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT f.id FROM processor_filter f \
             JOIN filter_tracker t ON t.filter_id = f.id \
             WHERE t.state = 'COMPLETE' AND t.last_poll_ms < $1",
        )
        .bind(older_than_ms)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get("id")?))
            .collect()
    }
}
