//! Bounded retry around optimistic-concurrency task status changes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use procq_core::SchedulerResult;
use procq_domain::repositories::{ChangeStatusResult, ProcessorTaskRepository};
use procq_domain::{NodeRef, ProcessorTask, TaskStatus};

const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Change a task's status and owner, retrying version conflicts with a
/// fresh reload each attempt.
///
/// Returns `Ok(None)` when the task no longer exists or retries were
/// exhausted; the row keeps its last persisted state either way.
pub async fn change_task_status(
    task_repo: &Arc<dyn ProcessorTaskRepository>,
    task: &ProcessorTask,
    node: Option<&NodeRef>,
    status: TaskStatus,
) -> SchedulerResult<Option<ProcessorTask>> {
    let mut current = task.clone();

    for attempt in 1..=MAX_ATTEMPTS {
        match task_repo
            .change_status(current.id, current.version, node, status)
            .await?
        {
            ChangeStatusResult::Updated(updated) => return Ok(Some(updated)),
            ChangeStatusResult::NotFound => {
                warn!(
                    task_id = current.id,
                    "task vanished during status change, treating as no-op"
                );
                return Ok(None);
            }
            ChangeStatusResult::Conflict => {
                if attempt == MAX_ATTEMPTS {
                    break;
                }
                tokio::time::sleep(RETRY_DELAY).await;
                match task_repo.load(current.id).await? {
                    Some(fresh) => current = fresh,
                    None => {
                        warn!(
                            task_id = current.id,
                            "task vanished during status change retry"
                        );
                        return Ok(None);
                    }
                }
            }
        }
    }

    error!(
        task_id = current.id,
        attempts = MAX_ATTEMPTS,
        "giving up on task status change after repeated conflicts"
    );
    Ok(None)
}
