use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use procq_domain::ProcessorTask;

/// Per-filter FIFO of tasks ready to be handed to workers.
///
/// The `filling` flag is the sole admission control for "someone is
/// already fetching more work for this filter". Priority across filters
/// is the scheduler's concern, not the queue's.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<ProcessorTask>>,
    filling: AtomicBool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, task: ProcessorTask) {
        self.tasks.lock().unwrap().push_back(task);
    }

    pub fn poll(&self) -> Option<ProcessorTask> {
        self.tasks.lock().unwrap().pop_front()
    }

    pub fn size(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn compare_and_set_filling(&self, expected: bool, new: bool) -> bool {
        self.filling
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_filling(&self, filling: bool) {
        self.filling.store(filling, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procq_domain::TaskStatus;

    fn task(id: i64) -> ProcessorTask {
        ProcessorTask {
            id,
            version: 1,
            filter_id: 1,
            stream_id: id,
            data: None,
            node_name: None,
            status: TaskStatus::Unprocessed,
            create_ms: 0,
            status_ms: 0,
            start_time_ms: None,
            end_time_ms: None,
        }
    }

    #[test]
    fn polls_in_insertion_order() {
        let queue = TaskQueue::new();
        queue.add(task(1));
        queue.add(task(2));
        queue.add(task(3));

        assert_eq!(queue.size(), 3);
        assert_eq!(queue.poll().unwrap().id, 1);
        assert_eq!(queue.poll().unwrap().id, 2);
        assert_eq!(queue.poll().unwrap().id, 3);
        assert!(queue.poll().is_none());
    }

    #[test]
    fn filling_flag_is_exclusive() {
        let queue = TaskQueue::new();
        assert!(queue.compare_and_set_filling(false, true));
        assert!(!queue.compare_and_set_filling(false, true));
        queue.set_filling(false);
        assert!(queue.compare_and_set_filling(false, true));
    }
}
