//! Repository abstractions over the relational store.

use async_trait::async_trait;

use procq_core::SchedulerResult;

use crate::entities::{FilterTracker, NodeRef, ProcessorFilter, ProcessorTask, TaskStatus};
use crate::value_objects::FindStreamCriteria;

#[async_trait]
pub trait ProcessorFilterRepository: Send + Sync {
    /// All filters whose filter flag and processor flag are both enabled,
    /// with their trackers.
    async fn find_enabled(&self) -> SchedulerResult<Vec<ProcessorFilter>>;

    /// Reload one filter fresh; it may have been deleted concurrently.
    async fn load(&self, id: i64) -> SchedulerResult<Option<ProcessorFilter>>;

    async fn save_tracker(&self, tracker: &FilterTracker) -> SchedulerResult<FilterTracker>;

    /// Delete a filter. The store must refuse (returning an error) while
    /// tasks still reference it.
    async fn delete(&self, id: i64) -> SchedulerResult<bool>;

    /// Ids of filters whose tracker is complete and was last polled before
    /// `older_than_ms`, as candidates for physical deletion.
    async fn find_deletable(&self, older_than_ms: i64) -> SchedulerResult<Vec<i64>>;
}

/// Outcome of an optimistic-concurrency status change.
#[derive(Debug)]
pub enum ChangeStatusResult {
    Updated(ProcessorTask),
    /// The task row is gone; treat as a no-op.
    NotFound,
    /// The row was modified concurrently; reload and retry.
    Conflict,
}

#[async_trait]
pub trait ProcessorTaskRepository: Send + Sync {
    async fn load(&self, id: i64) -> SchedulerResult<Option<ProcessorTask>>;

    /// Unprocessed tasks with no owning node whose stream is unlocked,
    /// the reclaim source for queue fills.
    async fn find_unowned_unlocked(
        &self,
        filter_id: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<ProcessorTask>>;

    /// Compare-and-swap on the version column. `node` of `None` releases
    /// ownership.
    async fn change_status(
        &self,
        task_id: i64,
        version: i32,
        node: Option<&NodeRef>,
        status: TaskStatus,
    ) -> SchedulerResult<ChangeStatusResult>;

    /// Set every task owned by `node` back to unprocessed and unowned.
    /// Returns the number of rows released.
    async fn release_owned_by(&self, node: &NodeRef) -> SchedulerResult<u64>;
}

#[async_trait]
pub trait MetaRepository: Send + Sync {
    /// Streams matching `criteria` with an id of at least `min_stream_id`,
    /// in id order, locked and unlocked alike. The bound is inclusive: the
    /// tracker cursor holds the next unprocessed id, not the last one done.
    async fn find_matching(
        &self,
        criteria: &FindStreamCriteria,
        min_stream_id: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<crate::entities::StreamMeta>>;

    async fn load(&self, id: i64) -> SchedulerResult<Option<crate::entities::StreamMeta>>;

    /// Greatest stream id currently in the store.
    async fn max_id(&self) -> SchedulerResult<Option<i64>>;
}
