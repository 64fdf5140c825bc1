pub mod clock;
pub mod entities;
pub mod ports;
pub mod repositories;
pub mod tracker_advance;
pub mod value_objects;

pub use entities::{
    FilterTracker, NodeRef, Processor, ProcessorFilter, ProcessorTask, StreamMeta, StreamStatus,
    TaskStatus, TrackerState,
};
pub use value_objects::{
    CreatedTasks, EventRef, EventRefs, FindStreamCriteria, IdRange, InclusiveRange,
    InclusiveRanges, Limits, Period, QueryData, QueryRoute,
};
