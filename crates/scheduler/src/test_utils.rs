//! In-memory fakes backing the scheduler tests.
//!
//! The fakes share one `TestStore` so repository views stay consistent,
//! and the materializer fake applies the same cursor arithmetic as the
//! real one so tracker assertions mean something.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use procq_core::config::SchedulerConfig;
use procq_core::{SchedulerError, SchedulerResult};
use procq_domain::clock::now_ms;
use procq_domain::ports::{
    EventSearchRequest, EventSearchService, NodeRegistry, StatisticsSink, StreamTaskCandidate,
    TaskMaterializer,
};
use procq_domain::repositories::{
    ChangeStatusResult, MetaRepository, ProcessorFilterRepository, ProcessorTaskRepository,
};
use procq_domain::tracker_advance::{advance_tracker, CreationSummary};
use procq_domain::{
    EventRefs, FilterTracker, FindStreamCriteria, InclusiveRange, NodeRef, Processor,
    ProcessorFilter, ProcessorTask, QueryData, QueryRoute, StreamMeta, StreamStatus, TaskStatus,
};

use crate::creator::TaskScheduler;

#[derive(Default)]
pub struct TestStore {
    pub filters: Mutex<BTreeMap<i64, ProcessorFilter>>,
    pub tasks: Mutex<BTreeMap<i64, ProcessorTask>>,
    pub streams: Mutex<BTreeMap<i64, StreamMeta>>,
    next_task_id: AtomicI64,
}

impl TestStore {
    pub fn add_filter(&self, filter: ProcessorFilter) {
        self.filters.lock().unwrap().insert(filter.id, filter);
    }

    pub fn add_stream(&self, stream: StreamMeta) {
        self.streams.lock().unwrap().insert(stream.id, stream);
    }

    pub fn add_task(&self, task: ProcessorTask) {
        let id = task.id;
        self.tasks.lock().unwrap().insert(id, task);
        self.next_task_id.fetch_max(id, Ordering::SeqCst);
    }

    pub fn filter(&self, id: i64) -> ProcessorFilter {
        self.filters.lock().unwrap().get(&id).unwrap().clone()
    }

    pub fn task(&self, id: i64) -> ProcessorTask {
        self.tasks.lock().unwrap().get(&id).unwrap().clone()
    }

    pub fn all_tasks(&self) -> Vec<ProcessorTask> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    fn next_task_id(&self) -> i64 {
        self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn criteria_filter(id: i64, priority: i32, feeds: &[&str]) -> ProcessorFilter {
    ProcessorFilter {
        id,
        processor: Processor {
            id,
            pipeline: format!("pipeline-{id}"),
            enabled: true,
        },
        query_data: QueryData {
            route: QueryRoute::Criteria,
            criteria: FindStreamCriteria {
                feeds: feeds.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            },
            limits: None,
        },
        priority,
        enabled: true,
        create_user: "test".to_string(),
        create_ms: 0,
        tracker: FilterTracker::new(id, id),
    }
}

pub fn search_filter(id: i64, priority: i32) -> ProcessorFilter {
    let mut filter = criteria_filter(id, priority, &[]);
    filter.query_data.route = QueryRoute::Search;
    filter
}

pub fn stream(id: i64, create_ms: i64, status: StreamStatus) -> StreamMeta {
    StreamMeta {
        id,
        feed: "test".to_string(),
        create_ms,
        status,
    }
}

pub fn unprocessed_task(id: i64, filter_id: i64, stream_id: i64) -> ProcessorTask {
    ProcessorTask {
        id,
        version: 1,
        filter_id,
        stream_id,
        data: None,
        node_name: None,
        status: TaskStatus::Unprocessed,
        create_ms: 0,
        status_ms: 0,
        start_time_ms: None,
        end_time_ms: None,
    }
}

pub struct InMemoryFilterRepository {
    pub store: Arc<TestStore>,
}

#[async_trait]
impl ProcessorFilterRepository for InMemoryFilterRepository {
    async fn find_enabled(&self) -> SchedulerResult<Vec<ProcessorFilter>> {
        Ok(self
            .store
            .filters
            .lock()
            .unwrap()
            .values()
            .filter(|f| f.is_processing_enabled())
            .cloned()
            .collect())
    }

    async fn load(&self, id: i64) -> SchedulerResult<Option<ProcessorFilter>> {
        Ok(self.store.filters.lock().unwrap().get(&id).cloned())
    }

    async fn save_tracker(&self, tracker: &FilterTracker) -> SchedulerResult<FilterTracker> {
        let mut filters = self.store.filters.lock().unwrap();
        let filter = filters
            .get_mut(&tracker.filter_id)
            .ok_or(SchedulerError::FilterNotFound {
                id: tracker.filter_id,
            })?;
        filter.tracker = tracker.clone();
        Ok(tracker.clone())
    }

    async fn delete(&self, id: i64) -> SchedulerResult<bool> {
        let referenced = self
            .store
            .tasks
            .lock()
            .unwrap()
            .values()
            .any(|t| t.filter_id == id);
        if referenced {
            return Err(SchedulerError::DatabaseOperation(format!(
                "filter {id} still has tasks"
            )));
        }
        Ok(self.store.filters.lock().unwrap().remove(&id).is_some())
    }

    async fn find_deletable(&self, older_than_ms: i64) -> SchedulerResult<Vec<i64>> {
        Ok(self
            .store
            .filters
            .lock()
            .unwrap()
            .values()
            .filter(|f| {
                f.tracker.is_complete()
                    && f.tracker.last_poll_ms.map(|ms| ms < older_than_ms).unwrap_or(false)
            })
            .map(|f| f.id)
            .collect())
    }
}

pub struct InMemoryTaskRepository {
    pub store: Arc<TestStore>,
}

#[async_trait]
impl ProcessorTaskRepository for InMemoryTaskRepository {
    async fn load(&self, id: i64) -> SchedulerResult<Option<ProcessorTask>> {
        Ok(self.store.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn find_unowned_unlocked(
        &self,
        filter_id: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<ProcessorTask>> {
        let streams = self.store.streams.lock().unwrap();
        Ok(self
            .store
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| {
                t.filter_id == filter_id
                    && t.status == TaskStatus::Unprocessed
                    && t.node_name.is_none()
                    && streams
                        .get(&t.stream_id)
                        .map(|s| s.status == StreamStatus::Unlocked)
                        .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn change_status(
        &self,
        task_id: i64,
        version: i32,
        node: Option<&NodeRef>,
        status: TaskStatus,
    ) -> SchedulerResult<ChangeStatusResult> {
        let mut tasks = self.store.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(ChangeStatusResult::NotFound);
        };
        if task.version != version {
            return Ok(ChangeStatusResult::Conflict);
        }
        task.version += 1;
        task.node_name = node.map(|n| n.name.clone());
        task.status = status;
        task.status_ms = now_ms();
        Ok(ChangeStatusResult::Updated(task.clone()))
    }

    async fn release_owned_by(&self, node: &NodeRef) -> SchedulerResult<u64> {
        let mut released = 0;
        for task in self.store.tasks.lock().unwrap().values_mut() {
            if task.node_name.as_deref() == Some(node.name.as_str()) {
                task.node_name = None;
                task.status = TaskStatus::Unprocessed;
                task.version += 1;
                released += 1;
            }
        }
        Ok(released)
    }
}

pub struct InMemoryMetaRepository {
    pub store: Arc<TestStore>,
}

#[async_trait]
impl MetaRepository for InMemoryMetaRepository {
    async fn find_matching(
        &self,
        criteria: &FindStreamCriteria,
        min_stream_id: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<StreamMeta>> {
        Ok(self
            .store
            .streams
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.id >= min_stream_id && s.status != StreamStatus::Deleted)
            .filter(|s| criteria.feeds.is_empty() || criteria.feeds.contains(&s.feed))
            .filter(|s| match criteria.stream_id_range {
                Some(range) => {
                    range.from.map(|from| s.id >= from).unwrap_or(true)
                        && range.to.map(|to| s.id <= to).unwrap_or(true)
                }
                None => true,
            })
            .filter(|s| match criteria.create_period {
                Some(period) => {
                    period.from_ms.map(|from| s.create_ms >= from).unwrap_or(true)
                        && period.to_ms.map(|to| s.create_ms < to).unwrap_or(true)
                }
                None => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load(&self, id: i64) -> SchedulerResult<Option<StreamMeta>> {
        Ok(self.store.streams.lock().unwrap().get(&id).cloned())
    }

    async fn max_id(&self) -> SchedulerResult<Option<i64>> {
        Ok(self.store.streams.lock().unwrap().keys().max().copied())
    }
}

/// Applies the same row-building and cursor rules as the transactional
/// materializer, minus the database.
pub struct InMemoryMaterializer {
    pub store: Arc<TestStore>,
}

#[async_trait]
impl TaskMaterializer for InMemoryMaterializer {
    async fn create_new_tasks(
        &self,
        filter: &ProcessorFilter,
        tracker: &FilterTracker,
        query_time_ms: i64,
        candidates: Vec<StreamTaskCandidate>,
        node: &NodeRef,
        max_stream_id: Option<i64>,
    ) -> SchedulerResult<procq_domain::CreatedTasks> {
        let create_ms = now_ms();
        let mut summary = CreationSummary::default();
        let mut available = Vec::new();
        let mut greatest: Option<(i64, Option<InclusiveRange>)> = None;

        {
            let mut tasks = self.store.tasks.lock().unwrap();
            for (meta, ranges) in &candidates {
                if meta.status == StreamStatus::Deleted {
                    continue;
                }
                let unlocked = meta.status == StreamStatus::Unlocked;
                let task = ProcessorTask {
                    id: self.store.next_task_id(),
                    version: 1,
                    filter_id: filter.id,
                    stream_id: meta.id,
                    data: ranges.as_ref().map(|r| r.ranges_to_string()),
                    node_name: unlocked.then(|| node.name.clone()),
                    status: TaskStatus::Unprocessed,
                    create_ms,
                    status_ms: create_ms,
                    start_time_ms: None,
                    end_time_ms: None,
                };

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

                tasks.insert(task.id, task.clone());
                if unlocked {
                    summary.available_created += 1;
                    available.push(task);
                }
            }
        }

        // The greatest stream may still have events past this round's
        // range, so the cursor stays on it.
        summary.event_id_range = greatest.and_then(|(_, outer)| outer);

        let mut tracker = tracker.clone();
        advance_tracker(&mut tracker, &summary, query_time_ms, create_ms, max_stream_id);
        if let Some(f) = self.store.filters.lock().unwrap().get_mut(&tracker.filter_id) {
            f.tracker = tracker;
        }

        Ok(procq_domain::CreatedTasks {
            available_count: available.len(),
            total_count: summary.total_created,
            event_count: summary.event_count,
            available,
        })
    }
}

#[derive(Default)]
pub struct StubSearchService {
    pub responses: Mutex<Vec<EventRefs>>,
    pub requests: Mutex<Vec<EventSearchRequest>>,
}

impl StubSearchService {
    pub fn push(&self, refs: EventRefs) {
        self.responses.lock().unwrap().push(refs);
    }
}

#[async_trait]
impl EventSearchService for StubSearchService {
    async fn search(&self, request: EventSearchRequest) -> SchedulerResult<EventRefs> {
        self.requests.lock().unwrap().push(request);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(EventRefs::default())
        } else {
            Ok(responses.remove(0))
        }
    }
}

pub struct StaticNodeRegistry {
    pub node: NodeRef,
}

impl NodeRegistry for StaticNodeRegistry {
    fn current_node(&self) -> NodeRef {
        self.node.clone()
    }
}

#[derive(Default)]
pub struct CapturingStatisticsSink {
    pub values: Mutex<Vec<(String, f64)>>,
}

impl StatisticsSink for CapturingStatisticsSink {
    fn emit(&self, key: &str, _timestamp_ms: i64, value: f64) {
        self.values.lock().unwrap().push((key.to_string(), value));
    }
}

pub struct Harness {
    pub store: Arc<TestStore>,
    pub scheduler: Arc<TaskScheduler>,
    pub search: Arc<StubSearchService>,
    pub stats: Arc<CapturingStatisticsSink>,
    pub node: NodeRef,
}

pub fn harness() -> Harness {
    harness_with(SchedulerConfig::default())
}

pub fn harness_with(config: SchedulerConfig) -> Harness {
    let store = Arc::new(TestStore::default());
    let node = NodeRef::new("node1");
    let search = Arc::new(StubSearchService::default());
    let stats = Arc::new(CapturingStatisticsSink::default());
    let scheduler = Arc::new(TaskScheduler::new(
        Arc::new(InMemoryFilterRepository {
            store: store.clone(),
        }),
        Arc::new(InMemoryTaskRepository {
            store: store.clone(),
        }),
        Arc::new(InMemoryMetaRepository {
            store: store.clone(),
        }),
        Arc::new(InMemoryMaterializer {
            store: store.clone(),
        }),
        search.clone(),
        Arc::new(StaticNodeRegistry { node: node.clone() }),
        stats.clone(),
        config,
    ));
    Harness {
        store,
        scheduler,
        search,
        stats,
        node,
    }
}
