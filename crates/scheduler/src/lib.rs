//! Task creation, queueing and assignment.

pub mod creator;
pub mod recent;
pub mod status;
pub mod task_queue;

pub use creator::TaskScheduler;

#[cfg(test)]
mod test_utils;
