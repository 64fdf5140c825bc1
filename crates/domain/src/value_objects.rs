use serde::{Deserialize, Serialize};

use crate::entities::ProcessorTask;

/// A closed `[min, max]` range of ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusiveRange {
    pub min: i64,
    pub max: i64,
}

impl InclusiveRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn point(value: i64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    /// Widen `range` to cover `value`, starting a new range if absent.
    pub fn extend(range: Option<InclusiveRange>, value: i64) -> InclusiveRange {
        match range {
            None => InclusiveRange::point(value),
            Some(r) => InclusiveRange {
                min: r.min.min(value),
                max: r.max.max(value),
            },
        }
    }
}

/// An ordered collection of disjoint event-id ranges within one stream.
///
/// Built from individual event ids; adjacent ids collapse into a single
/// range so the serialized payload stays compact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InclusiveRanges {
    ranges: Vec<InclusiveRange>,
}

impl InclusiveRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[InclusiveRange] {
        &self.ranges
    }

    /// Number of individual events covered by all ranges.
    pub fn count(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| (r.max - r.min + 1) as u64)
            .sum()
    }

    /// The single range spanning from the first min to the last max.
    pub fn outer_range(&self) -> Option<InclusiveRange> {
        match (self.ranges.first(), self.ranges.last()) {
            (Some(first), Some(last)) => Some(InclusiveRange::new(first.min, last.max)),
            _ => None,
        }
    }

    /// Add one event id, merging into an existing or adjacent range where
    /// possible and keeping the collection ordered and disjoint.
    pub fn add_event(&mut self, event_id: i64) {
        let pos = self.ranges.partition_point(|r| r.max < event_id - 1);

        if pos < self.ranges.len() {
            let range = &mut self.ranges[pos];
            if event_id >= range.min && event_id <= range.max {
                return;
            }
            if event_id == range.min - 1 {
                range.min = event_id;
                return;
            }
            if event_id == range.max + 1 {
                range.max = event_id;
                if pos + 1 < self.ranges.len() && self.ranges[pos + 1].min == event_id + 1 {
                    let max = self.ranges[pos + 1].max;
                    self.ranges[pos].max = max;
                    self.ranges.remove(pos + 1);
                }
                return;
            }
        }

        self.ranges.insert(pos, InclusiveRange::point(event_id));
    }

    /// Keep at most `limit` ranges, trimming the oldest (lowest) ones.
    /// The boolean reports whether anything was trimmed.
    pub fn sub_ranges(&self, limit: usize) -> (InclusiveRanges, bool) {
        if self.ranges.len() <= limit {
            return (self.clone(), false);
        }
        let start = self.ranges.len() - limit;
        (
            InclusiveRanges {
                ranges: self.ranges[start..].to_vec(),
            },
            true,
        )
    }

    /// Canonical serialization: flattened `min,max` pairs.
    pub fn ranges_to_string(&self) -> String {
        let mut out = String::new();
        for range in &self.ranges {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(&range.min.to_string());
            out.push(',');
            out.push_str(&range.max.to_string());
        }
        out
    }

    pub fn ranges_from_string(data: &str) -> Option<InclusiveRanges> {
        if data.is_empty() {
            return Some(InclusiveRanges::new());
        }
        let values: Option<Vec<i64>> = data.split(',').map(|v| v.parse().ok()).collect();
        let values = values?;
        if values.len() % 2 != 0 {
            return None;
        }
        let ranges = values
            .chunks(2)
            .map(|pair| InclusiveRange::new(pair[0], pair[1]))
            .collect();
        Some(InclusiveRanges { ranges })
    }
}

/// The stored query of a processor filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryData {
    pub route: QueryRoute,
    pub criteria: FindStreamCriteria,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
}

/// How tasks are derived from the query: direct stream criteria, or a
/// fine-grained event search producing per-stream event ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryRoute {
    #[serde(rename = "CRITERIA")]
    Criteria,
    #[serde(rename = "SEARCH")]
    Search,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindStreamCriteria {
    #[serde(default)]
    pub feeds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id_range: Option<IdRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_period: Option<Period>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IdRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Period {
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
}

/// Caps on search-based task creation. Exceeding any of them completes
/// the tracker for good.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Limits {
    pub duration_ms: Option<i64>,
    pub stream_count: Option<i64>,
    pub event_count: Option<i64>,
}

/// A single event hit from the search service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRef {
    pub stream_id: i64,
    pub event_id: i64,
}

impl EventRef {
    pub fn new(stream_id: i64, event_id: i64) -> Self {
        Self {
            stream_id,
            event_id,
        }
    }
}

/// Search hits, ordered by (stream id, event id).
#[derive(Debug, Clone, Default)]
pub struct EventRefs {
    pub refs: Vec<EventRef>,
    /// The search stopped early because it hit one of its bounds.
    pub reached_limit: bool,
}

impl EventRefs {
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Outcome of one materialization round.
#[derive(Debug, Default)]
pub struct CreatedTasks {
    /// Tasks owned by this node whose streams are unlocked, ready to queue.
    pub available: Vec<ProcessorTask>,
    pub available_count: usize,
    pub total_count: usize,
    pub event_count: u64,
}
