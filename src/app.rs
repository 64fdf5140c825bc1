use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info};

use procq_core::AppConfig;
use procq_domain::ports::{ClusterLockService, NodeRegistry};
use procq_domain::repositories::ProcessorFilterRepository;
use procq_infrastructure::cluster_lock::PgAdvisoryLock;
use procq_infrastructure::database::{
    create_pool, PgFilterRepository, PgMetaRepository, PgTaskMaterializer, PgTaskRepository,
    TaskRetentionExecutor,
};
use procq_infrastructure::node::HostnameNodeRegistry;
use procq_infrastructure::search::UnconfiguredEventSearchService;
use procq_infrastructure::stats::MetricsStatisticsSink;
use procq_scheduler::TaskScheduler;

const STATISTICS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Application {
    scheduler: Arc<TaskScheduler>,
    retention: Arc<TaskRetentionExecutor>,
    poll_interval: Duration,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let pool = create_pool(&config.database)
            .await
            .context("connecting to the database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("applying migrations")?;

        let lock_service: Arc<dyn ClusterLockService> =
            Arc::new(PgAdvisoryLock::new(pool.clone()));
        let filter_repo: Arc<dyn ProcessorFilterRepository> =
            Arc::new(PgFilterRepository::new(pool.clone()));

        let node_registry =
            Arc::new(HostnameNodeRegistry::new().context("resolving node identity")?);
        info!(node = %node_registry.current_node().name, "node identity resolved");

        let scheduler = Arc::new(TaskScheduler::new(
            filter_repo.clone(),
            Arc::new(PgTaskRepository::new(pool.clone())),
            Arc::new(PgMetaRepository::new(pool.clone())),
            Arc::new(PgTaskMaterializer::new(pool.clone(), lock_service.clone())),
            Arc::new(UnconfiguredEventSearchService),
            node_registry,
            Arc::new(MetricsStatisticsSink),
            config.scheduler.clone(),
        ));

        let retention = Arc::new(TaskRetentionExecutor::new(
            pool,
            lock_service,
            filter_repo,
            config.retention.clone(),
        ));

        Ok(Self {
            scheduler,
            retention,
            poll_interval: config.scheduler.poll_interval_duration(),
        })
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.scheduler.startup().await;
        info!(poll_interval = ?self.poll_interval, "scheduler started");

        let mut poll = tokio::time::interval(self.poll_interval);
        let mut stats = tokio::time::interval(STATISTICS_INTERVAL);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.scheduler.fill_task_store();
                    if self.scheduler.delete_due() {
                        // Reschedule up front so a slow run is not re-spawned
                        // on the next tick; the retention lock covers races.
                        self.scheduler.reschedule_delete();
                        let retention = self.retention.clone();
                        tokio::spawn(async move {
                            if let Err(e) = retention.exec().await {
                                error!("retention run failed: {e}");
                            }
                        });
                    }
                }
                _ = stats.tick() => {
                    self.scheduler.write_queue_statistics();
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("stopping scheduler");
        self.retention.interrupt();
        self.scheduler.shutdown().await;
        Ok(())
    }
}
