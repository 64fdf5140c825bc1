use async_trait::async_trait;

use procq_core::{SchedulerError, SchedulerResult};
use procq_domain::ports::{EventSearchRequest, EventSearchService};
use procq_domain::EventRefs;

/// Placeholder for deployments without an event search engine. Failing
/// the request leaves the filter's tracker untouched, so search-route
/// filters are simply retried once an engine is wired in.
pub struct UnconfiguredEventSearchService;

#[async_trait]
impl EventSearchService for UnconfiguredEventSearchService {
    async fn search(&self, _request: EventSearchRequest) -> SchedulerResult<EventRefs> {
        Err(SchedulerError::Search(
            "no event search engine is configured".to_string(),
        ))
    }
}
