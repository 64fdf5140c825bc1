//! Cursor and window arithmetic applied to a tracker after one
//! materialization round.
//!
//! Kept free of I/O so the forward-only cursor guarantees can be tested
//! directly. The caller persists the tracker afterwards, inside the same
//! transaction that inserted the tasks.

use tracing::info;

use crate::entities::{FilterTracker, TrackerState};
use crate::value_objects::InclusiveRange;

/// Aggregates gathered while building task rows for one round.
#[derive(Debug, Default)]
pub struct CreationSummary {
    pub total_created: usize,
    pub available_created: usize,
    pub event_count: u64,
    /// Min/max stream id across all units this round.
    pub stream_id_range: Option<InclusiveRange>,
    /// Min/max stream create time across all units this round.
    pub stream_ms_range: Option<InclusiveRange>,
    /// Outer event range of the unit with the greatest stream id, when
    /// that unit carried an event range.
    pub event_id_range: Option<InclusiveRange>,
}

/// Advance `tracker` past the work covered by `summary`.
///
/// When tasks were created the cursor moves just past the greatest unit
/// processed; an event range leaves `min_stream_id` on that unit so its
/// remaining events stay reachable. When nothing was created the window
/// still advances to `query_time_ms`, and past `max_stream_id` when known,
/// so proven-unmatching data is never rescanned. The cursor never moves
/// backward.
pub fn advance_tracker(
    tracker: &mut FilterTracker,
    summary: &CreationSummary,
    query_time_ms: i64,
    create_ms: i64,
    max_stream_id: Option<i64>,
) {
    if summary.total_created > 0 {
        let id_range = summary
            .stream_id_range
            .expect("stream id range present when tasks were created");
        let ms_range = summary
            .stream_ms_range
            .expect("stream ms range present when tasks were created");

        // Start a new creation window if we never had one, or the last
        // poll produced nothing.
        if tracker.min_stream_create_ms.is_none() || tracker.last_poll_task_count == Some(0) {
            tracker.min_stream_create_ms = Some(ms_range.min);
        }
        tracker.stream_create_ms = Some(ms_range.max);

        match summary.event_id_range {
            Some(event_range) => {
                // Stay on the greatest unit; only its events past the
                // range are still wanted.
                tracker.min_stream_id = tracker.min_stream_id.max(id_range.max);
                tracker.min_event_id = event_range.max + 1;
            }
            None => {
                tracker.min_stream_id = tracker.min_stream_id.max(id_range.max + 1);
                tracker.min_event_id = 0;
            }
        }
    } else {
        // Nothing created, so the whole window up to the query time is
        // proven empty.
        tracker.min_stream_create_ms = Some(create_ms);
        tracker.stream_create_ms = Some(query_time_ms);

        if let Some(max_id) = max_stream_id {
            tracker.min_stream_id = tracker.min_stream_id.max(max_id + 1);
            tracker.min_event_id = 0;
        }
    }

    tracker.stream_count += summary.total_created as i64;
    tracker.event_count += summary.event_count as i64;
    tracker.last_poll_ms = Some(create_ms);
    tracker.last_poll_task_count = Some(summary.total_created as i64);
    tracker.state = TrackerState::Active;
    tracker.last_message = None;

    // A bounded filter is finished once its high-water mark passes the bound.
    if let (Some(max_create_ms), Some(create_high_water)) =
        (tracker.max_stream_create_ms, tracker.stream_create_ms)
    {
        if create_high_water > max_create_ms {
            info!(
                filter_id = tracker.filter_id,
                "finished task creation for bounded filter"
            );
            tracker.state = TrackerState::Complete;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FilterTracker {
        FilterTracker::new(1, 1)
    }

    fn summary(total: usize, ids: (i64, i64), ms: (i64, i64)) -> CreationSummary {
        CreationSummary {
            total_created: total,
            available_created: total,
            event_count: 0,
            stream_id_range: Some(InclusiveRange::new(ids.0, ids.1)),
            stream_ms_range: Some(InclusiveRange::new(ms.0, ms.1)),
            event_id_range: None,
        }
    }

    #[test]
    fn whole_stream_round_moves_cursor_past_greatest_unit() {
        let mut t = tracker();
        advance_tracker(&mut t, &summary(3, (101, 103), (500, 700)), 1_000, 1_000, None);

        assert_eq!(t.min_stream_id, 104);
        assert_eq!(t.min_event_id, 0);
        assert_eq!(t.stream_count, 3);
        assert_eq!(t.last_poll_task_count, Some(3));
        assert_eq!(t.min_stream_create_ms, Some(500));
        assert_eq!(t.stream_create_ms, Some(700));
        assert_eq!(t.state, TrackerState::Active);
    }

    #[test]
    fn event_range_round_stays_on_greatest_unit() {
        let mut t = tracker();
        let mut s = summary(2, (101, 102), (500, 600));
        s.event_id_range = Some(InclusiveRange::new(10, 25));
        s.event_count = 16;
        advance_tracker(&mut t, &s, 1_000, 1_000, None);

        assert_eq!(t.min_stream_id, 102);
        assert_eq!(t.min_event_id, 26);
        assert_eq!(t.event_count, 16);
    }

    #[test]
    fn min_event_id_resets_when_stream_advances() {
        let mut t = tracker();
        let mut s = summary(1, (101, 101), (500, 500));
        s.event_id_range = Some(InclusiveRange::new(1, 5));
        advance_tracker(&mut t, &s, 1_000, 1_000, None);
        assert_eq!((t.min_stream_id, t.min_event_id), (101, 6));

        advance_tracker(&mut t, &summary(1, (105, 105), (600, 600)), 2_000, 2_000, None);
        assert_eq!((t.min_stream_id, t.min_event_id), (106, 0));
    }

    #[test]
    fn cursor_is_non_decreasing_across_rounds() {
        let mut t = tracker();
        advance_tracker(&mut t, &summary(3, (101, 110), (500, 700)), 1_000, 1_000, None);
        let after_first = t.min_stream_id;

        // An overlapping (stale) candidate set must not pull the cursor back.
        advance_tracker(&mut t, &summary(2, (101, 105), (500, 600)), 2_000, 2_000, None);
        assert!(t.min_stream_id >= after_first);
    }

    #[test]
    fn empty_round_advances_window_and_skips_known_streams() {
        let mut t = tracker();
        t.min_stream_id = 50;
        advance_tracker(&mut t, &CreationSummary::default(), 1_234, 1_250, Some(200));

        assert_eq!(t.min_stream_id, 201);
        assert_eq!(t.min_event_id, 0);
        assert_eq!(t.min_stream_create_ms, Some(1_250));
        assert_eq!(t.stream_create_ms, Some(1_234));
        assert_eq!(t.last_poll_task_count, Some(0));
    }

    #[test]
    fn empty_round_without_max_id_keeps_cursor() {
        let mut t = tracker();
        t.min_stream_id = 50;
        advance_tracker(&mut t, &CreationSummary::default(), 1_234, 1_250, None);
        assert_eq!(t.min_stream_id, 50);
    }

    #[test]
    fn passing_the_bound_completes_the_tracker() {
        let mut t = tracker();
        t.max_stream_create_ms = Some(650);
        advance_tracker(&mut t, &summary(2, (101, 102), (600, 700)), 1_000, 1_000, None);
        assert_eq!(t.state, TrackerState::Complete);
    }

    #[test]
    fn under_the_bound_stays_active() {
        let mut t = tracker();
        t.max_stream_create_ms = Some(9_999);
        advance_tracker(&mut t, &summary(2, (101, 102), (600, 700)), 1_000, 1_000, None);
        assert_eq!(t.state, TrackerState::Active);
    }

    #[test]
    fn new_window_starts_after_empty_poll() {
        let mut t = tracker();
        advance_tracker(&mut t, &summary(1, (101, 101), (500, 500)), 1_000, 1_000, None);
        advance_tracker(&mut t, &CreationSummary::default(), 2_000, 2_000, Some(101));
        advance_tracker(&mut t, &summary(1, (102, 102), (3_000, 3_000)), 4_000, 4_000, None);
        assert_eq!(t.min_stream_create_ms, Some(3_000));
    }
}
