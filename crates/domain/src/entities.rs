use serde::{Deserialize, Serialize};

use crate::value_objects::QueryData;

/// A processing pipeline that filters are bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processor {
    pub id: i64,
    pub pipeline: String,
    pub enabled: bool,
}

/// A saved selection criterion producing tasks for matching streams.
///
/// Mutated by the scheduler only through its tracker. A filter may only be
/// deleted once its tracker is complete and no tasks reference it any more;
/// the store enforces that with a referential-integrity constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorFilter {
    pub id: i64,
    pub processor: Processor,
    pub query_data: QueryData,
    /// Higher priorities are served first.
    pub priority: i32,
    pub enabled: bool,
    pub create_user: String,
    pub create_ms: i64,
    pub tracker: FilterTracker,
}

impl ProcessorFilter {
    pub fn is_processing_enabled(&self) -> bool {
        self.enabled && self.processor.enabled
    }
}

/// Per-filter progress cursor, one-to-one with [`ProcessorFilter`].
///
/// `min_stream_id`/`min_event_id` form the exclusive lower bound for the
/// next scan and only ever move forward. Once `state` is `Complete` the
/// filter will never produce tasks again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterTracker {
    pub id: i64,
    pub filter_id: i64,
    pub min_stream_id: i64,
    pub min_event_id: i64,
    pub min_stream_create_ms: Option<i64>,
    /// High-water mark of stream create times seen this round.
    pub stream_create_ms: Option<i64>,
    /// Upper bound on stream create time, set once it is known that the
    /// filter is time-bounded. Never cleared once set.
    pub max_stream_create_ms: Option<i64>,
    pub stream_count: i64,
    pub event_count: i64,
    pub last_poll_ms: Option<i64>,
    pub last_poll_task_count: Option<i64>,
    pub state: TrackerState,
    /// Free-text progress detail for display, separate from the state.
    pub last_message: Option<String>,
}

impl FilterTracker {
    pub fn new(id: i64, filter_id: i64) -> Self {
        Self {
            id,
            filter_id,
            min_stream_id: 0,
            min_event_id: 0,
            min_stream_create_ms: None,
            stream_create_ms: None,
            max_stream_create_ms: None,
            stream_count: 0,
            event_count: 0,
            last_poll_ms: None,
            last_poll_task_count: None,
            state: TrackerState::Active,
            last_message: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == TrackerState::Complete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerState {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "SEARCHING")]
    Searching,
    #[serde(rename = "CREATING")]
    Creating,
    /// Terminal. The filter will never again produce tasks.
    #[serde(rename = "COMPLETE")]
    Complete,
}

impl TrackerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerState::Active => "ACTIVE",
            TrackerState::Searching => "SEARCHING",
            TrackerState::Creating => "CREATING",
            TrackerState::Complete => "COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(TrackerState::Active),
            "SEARCHING" => Some(TrackerState::Searching),
            "CREATING" => Some(TrackerState::Creating),
            "COMPLETE" => Some(TrackerState::Complete),
            _ => None,
        }
    }
}

/// One unit of work, assigned to and executed by a worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorTask {
    pub id: i64,
    /// Optimistic-lock version, bumped on every status change.
    pub version: i32,
    pub filter_id: i64,
    pub stream_id: i64,
    /// Serialized event-range payload; `None` means the whole stream.
    pub data: Option<String>,
    /// Owning node. `None` means unclaimed.
    pub node_name: Option<String>,
    pub status: TaskStatus,
    pub create_ms: i64,
    pub status_ms: i64,
    pub start_time_ms: Option<i64>,
    pub end_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "UNPROCESSED")]
    Unprocessed,
    #[serde(rename = "ASSIGNED")]
    Assigned,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "DELETED")]
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Unprocessed => "UNPROCESSED",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNPROCESSED" => Some(TaskStatus::Unprocessed),
            "ASSIGNED" => Some(TaskStatus::Assigned),
            "PROCESSING" => Some(TaskStatus::Processing),
            "COMPLETE" => Some(TaskStatus::Complete),
            "FAILED" => Some(TaskStatus::Failed),
            "DELETED" => Some(TaskStatus::Deleted),
            _ => None,
        }
    }
}

/// One ingested stream as seen through the meta store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMeta {
    pub id: i64,
    pub feed: String,
    pub create_ms: i64,
    pub status: StreamStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    #[serde(rename = "UNLOCKED")]
    Unlocked,
    #[serde(rename = "LOCKED")]
    Locked,
    #[serde(rename = "DELETED")]
    Deleted,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Unlocked => "UNLOCKED",
            StreamStatus::Locked => "LOCKED",
            StreamStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNLOCKED" => Some(StreamStatus::Unlocked),
            "LOCKED" => Some(StreamStatus::Locked),
            "DELETED" => Some(StreamStatus::Deleted),
            _ => None,
        }
    }
}

/// Identity of a cooperating node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub name: String,
}

impl NodeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
