use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use procq_core::config::DatabaseConfig;
use procq_core::SchedulerResult;

pub mod batch_insert;
pub mod filter_repository;
pub mod meta_repository;
pub mod retention;
pub mod task_materializer;
pub mod task_repository;

pub use filter_repository::PgFilterRepository;
pub use meta_repository::PgMetaRepository;
pub use retention::TaskRetentionExecutor;
pub use task_materializer::PgTaskMaterializer;
pub use task_repository::PgTaskRepository;

pub async fn create_pool(config: &DatabaseConfig) -> SchedulerResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    info!(max_connections = config.max_connections, "database pool ready");
    Ok(pool)
}
