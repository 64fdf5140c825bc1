use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use procq_core::{SchedulerError, SchedulerResult};
use procq_domain::repositories::MetaRepository;
use procq_domain::{FindStreamCriteria, StreamMeta, StreamStatus};

pub struct PgMetaRepository {
    pool: PgPool,
}

/// Bindable values collected while the criteria clauses are assembled.
enum MetaQueryParam {
    I64(i64),
    TextArray(Vec<String>),
}

impl PgMetaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_meta(row: &sqlx::postgres::PgRow) -> SchedulerResult<StreamMeta> {
        let status: String = row.try_get("status")?;
        let status = StreamStatus::parse(&status).ok_or_else(|| {
            SchedulerError::DatabaseOperation(format!("unknown stream status '{status}'"))
        })?;
        Ok(StreamMeta {
            id: row.try_get("id")?,
            feed: row.try_get("feed")?,
            create_ms: row.try_get("create_ms")?,
            status,
        })
    }
}

#[async_trait]
impl MetaRepository for PgMetaRepository {
    #[instrument(skip(self, criteria))]
    async fn find_matching(
        &self,
        criteria: &FindStreamCriteria,
        min_stream_id: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<StreamMeta>> {
        let mut sql = String::from(
            "SELECT id, feed, create_ms, status FROM stream_meta \
             WHERE status <> 'DELETED' AND id >= $1",
        );
        let mut params = vec![MetaQueryParam::I64(min_stream_id)];

        if !criteria.feeds.is_empty() {
            params.push(MetaQueryParam::TextArray(criteria.feeds.clone()));
            sql.push_str(&format!(" AND feed = ANY(${})", params.len()));
        }
        if let Some(range) = criteria.stream_id_range {
            if let Some(from) = range.from {
                params.push(MetaQueryParam::I64(from));
                sql.push_str(&format!(" AND id >= ${}", params.len()));
            }
            if let Some(to) = range.to {
                params.push(MetaQueryParam::I64(to));
                sql.push_str(&format!(" AND id <= ${}", params.len()));
            }
        }
        if let Some(period) = criteria.create_period {
            if let Some(from_ms) = period.from_ms {
                params.push(MetaQueryParam::I64(from_ms));
                sql.push_str(&format!(" AND create_ms >= ${}", params.len()));
            }
            if let Some(to_ms) = period.to_ms {
                params.push(MetaQueryParam::I64(to_ms));
                sql.push_str(&format!(" AND create_ms < ${}", params.len()));
            }
        }
        params.push(MetaQueryParam::I64(limit as i64));
        sql.push_str(&format!(" ORDER BY id LIMIT ${}", params.len()));

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = match param {
                MetaQueryParam::I64(value) => query.bind(*value),
                MetaQueryParam::TextArray(values) => query.bind(values.as_slice()),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_meta).collect()
    }

    async fn load(&self, id: i64) -> SchedulerResult<Option<StreamMeta>> {
        let row = sqlx::query("SELECT id, feed, create_ms, status FROM stream_meta WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_meta).transpose()
    }

    async fn max_id(&self) -> SchedulerResult<Option<i64>> {
        let row = sqlx::query("SELECT MAX(id) AS max_id FROM stream_meta")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_id")?)
    }
}
