use std::sync::Arc;

use procq_core::SchedulerResult;
use procq_domain::repositories::MetaRepository;
use procq_domain::ProcessorFilter;

/// Snapshot of what has arrived in the meta store since the last create
/// cycle, gathered once per cycle by the master node.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecentStreamInfo {
    /// Greatest stream id in the store at the start of the cycle.
    pub max_stream_id: Option<i64>,
}

impl RecentStreamInfo {
    pub async fn gather(meta_repo: &Arc<dyn MetaRepository>) -> SchedulerResult<Self> {
        Ok(Self {
            max_stream_id: meta_repo.max_id().await?,
        })
    }

    /// Whether recently arrived data may match the filter. Conservatively
    /// answers yes for every filter, so an exhausted filter is always
    /// rechecked once new data exists.
    pub fn is_applicable(&self, _filter: &ProcessorFilter) -> bool {
        true
    }
}
