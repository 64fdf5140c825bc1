//! The task creation and assignment orchestrator.
//!
//! Keeps a pool of processor tasks ready to hand out, topping up each
//! filter's queue whenever it drops below the half-full water mark. Task
//! creation itself is serialized process-locally here and cluster-wide by
//! the materializer's lock, so only the lock-holding master node creates
//! tasks at any moment.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use procq_core::config::SchedulerConfig;
use procq_core::SchedulerResult;
use procq_domain::clock::now_ms;
use procq_domain::ports::{
    EventSearchRequest, EventSearchService, NodeRegistry, StatisticsSink, StreamTaskCandidate,
    TaskMaterializer,
};
use procq_domain::repositories::{
    MetaRepository, ProcessorFilterRepository, ProcessorTaskRepository,
};
use procq_domain::{
    EventRef, EventRefs, FilterTracker, NodeRef, ProcessorFilter, ProcessorTask, QueryRoute,
    TaskStatus, TrackerState,
};

use crate::recent::RecentStreamInfo;
use crate::status::change_task_status;
use crate::task_queue::TaskQueue;

const QUEUE_SIZE_STAT_KEY: &str = "processorTaskQueueSize";
const MAX_EVENTS_PER_SEARCH: u64 = 1_000_000;
const MAX_EVENTS_PER_STREAM: u64 = 1_000;
const MAX_RANGES_PER_STREAM: usize = 1_000;

pub struct TaskScheduler {
    filter_repo: Arc<dyn ProcessorFilterRepository>,
    task_repo: Arc<dyn ProcessorTaskRepository>,
    meta_repo: Arc<dyn MetaRepository>,
    materializer: Arc<dyn TaskMaterializer>,
    search_service: Arc<dyn EventSearchService>,
    node_registry: Arc<dyn NodeRegistry>,
    statistics: Arc<dyn StatisticsSink>,
    config: SchedulerConfig,
    poll_interval: Duration,
    delete_interval: Duration,

    /// Latest enabled-filter snapshot, swapped whole each cycle.
    prioritized_filters: RwLock<Arc<Vec<ProcessorFilter>>>,
    queues: RwLock<HashMap<i64, Arc<TaskQueue>>>,
    /// A create cycle is in flight somewhere.
    filling: AtomicBool,
    /// Did the last attempt per filter find nothing or hit its limit?
    exhausted: Mutex<HashMap<i64, bool>>,
    next_poll_ms: AtomicI64,
    next_delete_ms: AtomicI64,
    /// Fills are only allowed between startup() and shutdown().
    allow_fill: AtomicBool,
    /// Serializes create cycles against each other and against
    /// startup/shutdown.
    create_tasks_lock: tokio::sync::Mutex<()>,
    last_queue_size_for_stats: AtomicI64,
    interrupted: AtomicBool,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        filter_repo: Arc<dyn ProcessorFilterRepository>,
        task_repo: Arc<dyn ProcessorTaskRepository>,
        meta_repo: Arc<dyn MetaRepository>,
        materializer: Arc<dyn TaskMaterializer>,
        search_service: Arc<dyn EventSearchService>,
        node_registry: Arc<dyn NodeRegistry>,
        statistics: Arc<dyn StatisticsSink>,
        config: SchedulerConfig,
    ) -> Self {
        let poll_interval = config.poll_interval_duration();
        Self {
            filter_repo,
            task_repo,
            meta_repo,
            materializer,
            search_service,
            node_registry,
            statistics,
            config,
            poll_interval,
            delete_interval: poll_interval * 10,
            prioritized_filters: RwLock::new(Arc::new(Vec::new())),
            queues: RwLock::new(HashMap::new()),
            filling: AtomicBool::new(false),
            exhausted: Mutex::new(HashMap::new()),
            next_poll_ms: AtomicI64::new(0),
            next_delete_ms: AtomicI64::new(0),
            allow_fill: AtomicBool::new(false),
            create_tasks_lock: tokio::sync::Mutex::new(()),
            last_queue_size_for_stats: AtomicI64::new(-1),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Release anything this node owned from a previous run, then allow
    /// queue fills.
    pub async fn startup(&self) {
        let _guard = self.create_tasks_lock.lock().await;
        let node = self.node_registry.current_node();
        match self.task_repo.release_owned_by(&node).await {
            Ok(released) => info!(
                node = %node.name,
                released,
                "released previously owned tasks back to unprocessed"
            ),
            Err(e) => error!("failed to release owned tasks at startup: {e}"),
        }
        self.interrupted.store(false, Ordering::Release);
        self.allow_fill.store(true, Ordering::Release);
    }

    /// Stop fills and release every queued task so another node can claim
    /// it without waiting for this node to return.
    pub async fn shutdown(&self) {
        let _guard = self.create_tasks_lock.lock().await;
        self.allow_fill.store(false, Ordering::Release);
        self.interrupted.store(true, Ordering::Release);

        let queues: Vec<Arc<TaskQueue>> = {
            let mut map = self.queues.write().unwrap();
            map.drain().map(|(_, q)| q).collect()
        };
        for queue in queues {
            while let Some(task) = queue.poll() {
                self.release(&task).await;
            }
        }
    }

    /// Hand out up to `count` queued tasks to `node`, highest-priority
    /// filters first, then opportunistically kick off a fill.
    ///
    /// Never blocks on task creation and never surfaces internal errors;
    /// the caller gets whatever could safely be provided.
    pub async fn assign_tasks(
        self: &Arc<Self>,
        node: &NodeRef,
        count: usize,
    ) -> Vec<ProcessorTask> {
        let mut assigned = Vec::new();

        if self.config.assign_tasks_enabled && count > 0 {
            let filters = self.prioritized_filters.read().unwrap().clone();
            'filters: for filter in filters.iter() {
                let queue = self.queues.read().unwrap().get(&filter.id).cloned();
                let Some(queue) = queue else { continue };

                while assigned.len() < count {
                    let Some(task) = queue.poll() else { break };
                    match change_task_status(&self.task_repo, &task, Some(node), TaskStatus::Assigned)
                        .await
                    {
                        Ok(Some(task)) => assigned.push(task),
                        Ok(None) => {}
                        Err(e) => {
                            error!(task_id = task.id, "failed to assign task: {e}");
                        }
                    }
                }
                if assigned.len() >= count {
                    break 'filters;
                }
            }
        }

        // Have a go at kicking off a fill.
        self.fill_task_store();

        trace!(
            node = %node.name,
            requested = count,
            assigned = assigned.len(),
            "assigned tasks"
        );
        assigned
    }

    /// Release tasks a node rejected or failed to start back to
    /// unprocessed and unowned.
    pub async fn abandon_tasks(&self, node: &NodeRef, tasks: &[ProcessorTask]) {
        for task in tasks {
            warn!(task_id = task.id, node = %node.name, "abandoning task");
            self.release(task).await;
        }
    }

    async fn release(&self, task: &ProcessorTask) {
        match change_task_status(&self.task_repo, task, None, TaskStatus::Unprocessed).await {
            Ok(_) => {}
            Err(e) => error!(task_id = task.id, "failed to release task: {e}"),
        }
    }

    /// Summed size of all in-memory queues.
    pub fn task_queue_size(&self) -> usize {
        self.queues
            .read()
            .unwrap()
            .values()
            .map(|q| q.size())
            .sum()
    }

    /// Lazy fill: kick off an asynchronous create cycle if none is in
    /// flight and the poll interval has passed.
    pub fn fill_task_store(self: &Arc<Self>) {
        if !self.allow_fill.load(Ordering::Acquire) {
            return;
        }
        if self.filling.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            if self.is_poll_due() {
                debug!("executing create tasks cycle");
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.create_tasks().await {
                        error!("create tasks cycle failed: {e}");
                    }
                    this.filling.store(false, Ordering::Release);
                });
            } else {
                self.filling.store(false, Ordering::Release);
            }
        }
    }

    fn is_poll_due(&self) -> bool {
        now_ms() > self.next_poll_ms.load(Ordering::Acquire)
    }

    fn schedule_next_poll(&self) {
        self.next_poll_ms
            .store(now_ms() + self.poll_interval.as_millis() as i64, Ordering::Release);
    }

    /// Run one create cycle. Serialized process-locally; the cluster-wide
    /// exclusion happens inside the materializer.
    pub async fn create_tasks(self: &Arc<Self>) -> SchedulerResult<()> {
        let _guard = self.create_tasks_lock.lock().await;
        if !self.allow_fill.load(Ordering::Acquire) {
            return Ok(());
        }
        self.do_create_tasks().await?;
        self.schedule_next_poll();
        Ok(())
    }

    async fn do_create_tasks(self: &Arc<Self>) -> SchedulerResult<()> {
        debug!("create cycle starting");
        let started = std::time::Instant::now();

        let mut filters = self.filter_repo.find_enabled().await?;
        trace!(count = filters.len(), "found enabled processor filters");

        // Stable sort: equal priorities keep repository load order.
        filters.sort_by(|a, b| b.priority.cmp(&a.priority));
        let filters = Arc::new(filters);
        *self.prioritized_filters.write().unwrap() = filters.clone();

        let recent = RecentStreamInfo::gather(&self.meta_repo).await?;
        let node = self.node_registry.current_node();

        let total_queue_size = self.config.total_queue_size;
        let half_queue_size = total_queue_size / 2;
        let mut remaining = total_queue_size as i64;

        for filter in filters.iter() {
            if self.interrupted.load(Ordering::Acquire) {
                break;
            }

            let queue = self.get_or_create_queue(filter.id);
            let queue_size = queue.size();
            remaining -= queue_size as i64;

            if remaining > 0 && queue_size < half_queue_size {
                if queue.compare_and_set_filling(false, true) {
                    let budget = remaining.min((total_queue_size - queue_size) as i64) as usize;
                    let created = self
                        .create_tasks_for_filter(&node, filter, queue, budget, &recent)
                        .await;
                    remaining -= created as i64;
                }
            }
        }

        // Drain queues whose filter is no longer enabled and release
        // their tasks.
        let enabled: HashSet<i64> = filters.iter().map(|f| f.id).collect();
        let stale: Vec<(i64, Arc<TaskQueue>)> = {
            let mut map = self.queues.write().unwrap();
            let stale_ids: Vec<i64> = map.keys().filter(|id| !enabled.contains(id)).copied().collect();
            stale_ids
                .into_iter()
                .filter_map(|id| map.remove(&id).map(|q| (id, q)))
                .collect()
        };
        for (filter_id, queue) in stale {
            debug!(filter_id, "releasing queued tasks for disabled filter");
            while let Some(task) = queue.poll() {
                self.release(&task).await;
            }
        }

        // We must be the master node, so make sure a retention delete is
        // coming up.
        self.schedule_delete();

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "create cycle finished");
        Ok(())
    }

    fn get_or_create_queue(&self, filter_id: i64) -> Arc<TaskQueue> {
        if let Some(queue) = self.queues.read().unwrap().get(&filter_id) {
            return queue.clone();
        }
        self.queues
            .write()
            .unwrap()
            .entry(filter_id)
            .or_insert_with(|| Arc::new(TaskQueue::new()))
            .clone()
    }

    /// Fill one filter's queue. All errors are caught here so one broken
    /// filter never affects the others; a failed filter is simply retried
    /// next cycle from its unchanged cursor. Returns the number of tasks
    /// added to the queue synchronously.
    async fn create_tasks_for_filter(
        self: &Arc<Self>,
        node: &NodeRef,
        filter: &ProcessorFilter,
        queue: Arc<TaskQueue>,
        budget: usize,
        recent: &RecentStreamInfo,
    ) -> usize {
        let mut searching = false;
        let result = self
            .fill_queue_for_filter(node, filter, &queue, budget, recent, &mut searching)
            .await;

        // The async search callback owns the flag while a search is
        // outstanding.
        if !searching {
            queue.set_filling(false);
        }

        match result {
            Ok(created) => created,
            Err(e) => {
                error!(filter_id = filter.id, "error creating tasks for filter: {e}");
                0
            }
        }
    }

    async fn fill_queue_for_filter(
        self: &Arc<Self>,
        node: &NodeRef,
        filter: &ProcessorFilter,
        queue: &Arc<TaskQueue>,
        budget: usize,
        recent: &RecentStreamInfo,
        searching: &mut bool,
    ) -> SchedulerResult<usize> {
        // Reload fresh: the filter may have been deleted or disabled since
        // the snapshot was taken.
        let Some(loaded) = self.filter_repo.load(filter.id).await? else {
            return Ok(0);
        };
        if !loaded.is_processing_enabled() {
            return Ok(0);
        }
        debug!(filter_id = loaded.id, priority = loaded.priority, "filling queue for filter");

        let mut tasks_to_create = budget;
        let mut count = 0usize;

        // Reclaim previously created tasks that no node owns and whose
        // stream has since unlocked.
        if self.config.fill_task_queue_enabled {
            count = self.add_unowned_tasks(node, &loaded, queue, tasks_to_create).await;
            tasks_to_create = tasks_to_create.saturating_sub(count);
        }

        if !self.config.create_tasks_enabled {
            // Terminated early, so assume this filter is not exhausted.
            self.exhausted.lock().unwrap().insert(loaded.id, false);
            return Ok(count);
        }

        if tasks_to_create == 0 || self.interrupted.load(Ordering::Acquire) {
            return Ok(count);
        }

        let was_exhausted = *self
            .exhausted
            .lock()
            .unwrap()
            .entry(loaded.id)
            .or_insert(false);
        debug!(filter_id = loaded.id, exhausted = was_exhausted, "considering task creation");

        let query_time_ms = now_ms();
        let mut tracker = loaded.tracker.clone();

        // Set the latest stream create time this filter can apply to, the
        // first time it is needed. It stays unset for filters that run
        // indefinitely.
        if tracker.max_stream_create_ms.is_none() {
            tracker.max_stream_create_ms =
                Self::derive_max_create_ms(&loaded, recent, query_time_ms);
        }

        if was_exhausted && !recent.is_applicable(&loaded) {
            return Ok(count);
        }

        if tracker.is_complete() {
            // Make sure observers can see a complete filter is no longer
            // delivering.
            if tracker.last_poll_task_count.unwrap_or(0) > 0 {
                tracker.last_poll_ms = Some(query_time_ms);
                tracker.last_poll_task_count = Some(0);
                self.filter_repo.save_tracker(&tracker).await?;
            }
            return Ok(count);
        }

        match loaded.query_data.route {
            QueryRoute::Search => {
                *searching = self
                    .create_tasks_from_search(
                        node.clone(),
                        loaded,
                        tracker,
                        query_time_ms,
                        tasks_to_create,
                        queue.clone(),
                        *recent,
                    )
                    .await?;
                Ok(count)
            }
            QueryRoute::Criteria => {
                let created = self
                    .create_tasks_from_criteria(
                        node,
                        &loaded,
                        tracker,
                        query_time_ms,
                        tasks_to_create,
                        queue,
                        recent,
                    )
                    .await?;
                Ok(count + created)
            }
        }
    }

    /// The upper stream-create-time bound, derived from whichever of the
    /// query's own limits and the current clock applies. `None` means the
    /// filter stays open-ended.
    fn derive_max_create_ms(
        filter: &ProcessorFilter,
        recent: &RecentStreamInfo,
        query_time_ms: i64,
    ) -> Option<i64> {
        let criteria = &filter.query_data.criteria;
        let max_stream_id = recent.max_stream_id.unwrap_or(0);
        let mut bound: Option<i64> = None;

        // An upper stream-id limit already below the live high-water mark
        // means no future stream can match.
        if let Some(range) = criteria.stream_id_range {
            if let Some(to) = range.to {
                if to < max_stream_id {
                    bound = min_opt(bound, Some(query_time_ms));
                }
            }
        }

        if let Some(period) = criteria.create_period {
            if let Some(to_ms) = period.to_ms {
                bound = min_opt(bound, Some(to_ms));
            }
        }

        // Criteria queries cannot see data arriving after this instant
        // without a rescan, so they end with the streams that exist now.
        // Search queries are allowed to remain open-ended.
        if filter.query_data.route == QueryRoute::Criteria {
            bound = min_opt(bound, Some(query_time_ms));
        }

        bound
    }

    /// Reclaim unowned, unlocked, unprocessed tasks for this filter into
    /// the queue. Per-task failures are logged and skipped.
    async fn add_unowned_tasks(
        &self,
        node: &NodeRef,
        filter: &ProcessorFilter,
        queue: &Arc<TaskQueue>,
        limit: usize,
    ) -> usize {
        if limit == 0 {
            return 0;
        }
        let mut count = 0usize;

        match self.task_repo.find_unowned_unlocked(filter.id, limit).await {
            Ok(tasks) => {
                for task in tasks {
                    match change_task_status(
                        &self.task_repo,
                        &task,
                        Some(node),
                        TaskStatus::Unprocessed,
                    )
                    .await
                    {
                        Ok(Some(claimed)) => {
                            queue.add(claimed);
                            count += 1;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(task_id = task.id, "failed to grab unowned task: {e}");
                        }
                    }
                    if self.interrupted.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
            Err(e) => error!(filter_id = filter.id, "failed to find unowned tasks: {e}"),
        }

        if count > 0 {
            debug!(filter_id = filter.id, count, "queued tasks that are no longer locked");
        }
        count
    }

    /// Create tasks straight from the filter's stream criteria. Returns
    /// the number of tasks queued.
    #[allow(clippy::too_many_arguments)]
    async fn create_tasks_from_criteria(
        &self,
        node: &NodeRef,
        filter: &ProcessorFilter,
        mut tracker: FilterTracker,
        query_time_ms: i64,
        required_tasks: usize,
        queue: &Arc<TaskQueue>,
        recent: &RecentStreamInfo,
    ) -> SchedulerResult<usize> {
        tracker.state = TrackerState::Creating;
        let tracker = self.filter_repo.save_tracker(&tracker).await?;

        // Locked and unlocked streams alike; locked ones produce unowned
        // tasks that get claimed later.
        let streams = self
            .meta_repo
            .find_matching(
                &filter.query_data.criteria,
                tracker.min_stream_id,
                required_tasks,
            )
            .await?;

        let candidates: Vec<StreamTaskCandidate> =
            streams.into_iter().map(|meta| (meta, None)).collect();

        let created = self
            .materializer
            .create_new_tasks(filter, &tracker, query_time_ms, candidates, node, recent.max_stream_id)
            .await?;

        debug!(
            filter_id = filter.id,
            total = created.total_count,
            available = created.available_count,
            required = required_tasks,
            "created tasks from criteria"
        );

        self.exhausted
            .lock()
            .unwrap()
            .insert(filter.id, created.total_count == 0);

        let queued = created.available.len();
        for task in created.available {
            queue.add(task);
        }
        Ok(queued)
    }

    /// Create tasks by running an asynchronous bounded event search.
    /// Returns true when a search was started; the spawned callback then
    /// owns the queue's filling flag.
    #[allow(clippy::too_many_arguments)]
    async fn create_tasks_from_search(
        self: &Arc<Self>,
        node: NodeRef,
        filter: ProcessorFilter,
        mut tracker: FilterTracker,
        query_time_ms: i64,
        required_tasks: usize,
        queue: Arc<TaskQueue>,
        recent: RecentStreamInfo,
    ) -> SchedulerResult<bool> {
        let mut max_streams = required_tasks as u64;
        let mut max_events = MAX_EVENTS_PER_SEARCH;

        if let Some(limits) = filter.query_data.limits {
            // A duration limit caps how long after filter creation tasks
            // may still be produced.
            if let Some(duration_ms) = limits.duration_ms {
                let end = filter.create_ms + duration_ms;
                if end < now_ms() {
                    tracker.state = TrackerState::Complete;
                    self.filter_repo.save_tracker(&tracker).await?;
                    return Ok(false);
                }
            }

            if let Some(stream_count) = limits.stream_count {
                let stream_limit = stream_count - tracker.stream_count;
                if stream_limit <= 0 {
                    tracker.state = TrackerState::Complete;
                    self.filter_repo.save_tracker(&tracker).await?;
                    return Ok(false);
                }
                max_streams = max_streams.min(stream_limit as u64);
            }

            if let Some(event_count) = limits.event_count {
                let event_limit = event_count - tracker.event_count;
                if event_limit <= 0 {
                    tracker.state = TrackerState::Complete;
                    self.filter_repo.save_tracker(&tracker).await?;
                    return Ok(false);
                }
                max_events = max_events.min(event_limit as u64);
            }
        }

        tracker.state = TrackerState::Searching;
        tracker.last_message = Some("Searching...".to_string());
        let tracker = self.filter_repo.save_tracker(&tracker).await?;

        let request = EventSearchRequest {
            query: filter.query_data.clone(),
            min_event: EventRef::new(tracker.min_stream_id, tracker.min_event_id),
            max_event: EventRef::new(i64::MAX, 0),
            max_streams,
            max_events,
            max_events_per_stream: MAX_EVENTS_PER_STREAM,
            timeout: self.poll_interval,
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.search_service.search(request).await {
                Ok(refs) => {
                    if let Err(e) = this
                        .finish_search(&node, &filter, tracker, query_time_ms, refs, &queue, recent)
                        .await
                    {
                        error!(filter_id = filter.id, "error creating tasks from search: {e}");
                    }
                }
                Err(e) => {
                    error!(filter_id = filter.id, "event search failed: {e}");
                }
            }
            queue.set_filling(false);
        });

        Ok(true)
    }

    /// Search completion: turn the hits into per-stream event ranges,
    /// materialize and queue them.
    #[allow(clippy::too_many_arguments)]
    async fn finish_search(
        &self,
        node: &NodeRef,
        filter: &ProcessorFilter,
        mut tracker: FilterTracker,
        query_time_ms: i64,
        refs: EventRefs,
        queue: &Arc<TaskQueue>,
        recent: RecentStreamInfo,
    ) -> SchedulerResult<()> {
        let result_size = refs.len();
        let reached_limit = refs.reached_limit;

        tracker.state = TrackerState::Creating;
        tracker.last_message = Some("Creating...".to_string());
        let tracker = self.filter_repo.save_tracker(&tracker).await?;

        let candidates = self.build_stream_candidates(&refs).await?;

        let created = self
            .materializer
            .create_new_tasks(filter, &tracker, query_time_ms, candidates, node, recent.max_stream_id)
            .await?;

        debug!(
            filter_id = filter.id,
            total = created.total_count,
            available = created.available_count,
            "created tasks from search"
        );

        self.exhausted
            .lock()
            .unwrap()
            .insert(filter.id, result_size == 0 || reached_limit);

        for task in created.available {
            queue.add(task);
        }
        Ok(())
    }

    /// Group ordered search hits into per-stream inclusive ranges, capping
    /// the ranges per stream. Once a stream had to be capped the rest of
    /// the result set is dropped; the cursor will pick it up next round.
    async fn build_stream_candidates(
        &self,
        refs: &EventRefs,
    ) -> SchedulerResult<Vec<StreamTaskCandidate>> {
        let mut candidates: Vec<StreamTaskCandidate> = Vec::new();
        let mut current: Option<(i64, procq_domain::InclusiveRanges)> = None;
        let mut trimmed = false;

        for event in &refs.refs {
            if trimmed {
                break;
            }
            match &mut current {
                Some((stream_id, ranges)) if *stream_id == event.stream_id => {
                    ranges.add_event(event.event_id);
                }
                _ => {
                    if let Some((stream_id, ranges)) = current.take() {
                        trimmed = self.push_candidate(&mut candidates, stream_id, ranges).await?;
                    }
                    if !trimmed {
                        let mut ranges = procq_domain::InclusiveRanges::new();
                        ranges.add_event(event.event_id);
                        current = Some((event.stream_id, ranges));
                    }
                }
            }
        }

        if !trimmed {
            if let Some((stream_id, ranges)) = current.take() {
                self.push_candidate(&mut candidates, stream_id, ranges).await?;
            }
        }

        Ok(candidates)
    }

    async fn push_candidate(
        &self,
        candidates: &mut Vec<StreamTaskCandidate>,
        stream_id: i64,
        ranges: procq_domain::InclusiveRanges,
    ) -> SchedulerResult<bool> {
        let (ranges, trimmed) = ranges.sub_ranges(MAX_RANGES_PER_STREAM);
        match self.meta_repo.load(stream_id).await? {
            Some(meta) => candidates.push((meta, Some(ranges))),
            None => warn!(stream_id, "search hit references a missing stream, skipping"),
        }
        Ok(trimmed)
    }

    /// Make sure a retention delete is scheduled.
    fn schedule_delete(&self) {
        if self.next_delete_ms.load(Ordering::Acquire) == 0 {
            let next = now_ms() + self.delete_interval.as_millis() as i64;
            self.next_delete_ms.store(next, Ordering::Release);
            debug!(next_delete_ms = next, "scheduled retention delete");
        }
    }

    /// Whether a scheduled retention delete has come due. Only nodes that
    /// have run a create cycle (i.e. the master) ever schedule one.
    pub fn delete_due(&self) -> bool {
        let next = self.next_delete_ms.load(Ordering::Acquire);
        next != 0 && now_ms() > next
    }

    pub fn reschedule_delete(&self) {
        self.next_delete_ms
            .store(now_ms() + self.delete_interval.as_millis() as i64, Ordering::Release);
    }

    /// Emit the summed queue size, but only when it changed since the last
    /// emission so an idle system does not flood the sink with zeros.
    pub fn write_queue_statistics(&self) {
        let queue_size = self.task_queue_size() as i64;
        if queue_size != self.last_queue_size_for_stats.load(Ordering::Acquire) {
            self.statistics.emit(QUEUE_SIZE_STAT_KEY, now_ms(), queue_size as f64);
            self.last_queue_size_for_stats.store(queue_size, Ordering::Release);
        }
    }

    /// Current exhaustion flag for a filter; absent means not exhausted.
    pub fn is_exhausted(&self, filter_id: i64) -> bool {
        self.exhausted
            .lock()
            .unwrap()
            .get(&filter_id)
            .copied()
            .unwrap_or(false)
    }
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) => x,
        (None, y) => y,
    }
}
