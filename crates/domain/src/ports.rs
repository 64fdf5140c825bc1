//! Ports onto external collaborators: cluster locking, node identity,
//! statistics, event search and the transactional task materializer.

use std::time::Duration;

use async_trait::async_trait;

use procq_core::SchedulerResult;

use crate::entities::{FilterTracker, NodeRef, ProcessorFilter, StreamMeta};
use crate::value_objects::{CreatedTasks, EventRef, EventRefs, InclusiveRanges, QueryData};

/// Cluster-wide mutual exclusion by name. The implementation may be a
/// distributed lock table, a consensus-backed lease or a local mutex for
/// single-node deployments; callers must not assume which.
#[async_trait]
pub trait ClusterLockService: Send + Sync {
    async fn try_lock(&self, name: &str) -> SchedulerResult<bool>;
    async fn lock(&self, name: &str) -> SchedulerResult<()>;
    async fn unlock(&self, name: &str) -> SchedulerResult<()>;
}

pub trait NodeRegistry: Send + Sync {
    fn current_node(&self) -> NodeRef;
}

/// Best-effort statistics emission; failures are logged, never propagated.
pub trait StatisticsSink: Send + Sync {
    fn emit(&self, key: &str, timestamp_ms: i64, value: f64);
}

#[derive(Debug, Clone)]
pub struct EventSearchRequest {
    pub query: QueryData,
    /// Inclusive lower cursor from the tracker: the next unprocessed
    /// (stream, event) position, which the results must include.
    pub min_event: EventRef,
    pub max_event: EventRef,
    pub max_streams: u64,
    pub max_events: u64,
    pub max_events_per_stream: u64,
    /// Partial results past this point are accepted as "reached limit".
    pub timeout: Duration,
}

/// Fine-grained event search; the engine behind it is out of scope.
#[async_trait]
pub trait EventSearchService: Send + Sync {
    async fn search(&self, request: EventSearchRequest) -> SchedulerResult<EventRefs>;
}

/// One stream with the optional event ranges its task should carry.
pub type StreamTaskCandidate = (StreamMeta, Option<InclusiveRanges>);

/// Transactional task materialization. Runs under a global cluster lock
/// so only one node in the cluster creates tasks at a time.
#[async_trait]
pub trait TaskMaterializer: Send + Sync {
    /// Persist one task row per candidate, advance the tracker and return
    /// the tasks that are immediately available for queueing (owned by
    /// `node` because their stream was unlocked).
    #[allow(clippy::too_many_arguments)]
    async fn create_new_tasks(
        &self,
        filter: &ProcessorFilter,
        tracker: &FilterTracker,
        query_time_ms: i64,
        candidates: Vec<StreamTaskCandidate>,
        node: &NodeRef,
        max_stream_id: Option<i64>,
    ) -> SchedulerResult<CreatedTasks>;
}
