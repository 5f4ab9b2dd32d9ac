//! Fold decoded activity events into contiguous half-open intervals.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::DriverId;
use crate::tacho::activity::{ActivityEvent, ActivityInterval, ActivityState, SourceFormat};

/// Interval produced from one file before ownership metadata is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltInterval {
    pub state: ActivityState,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// Build intervals from `events`.
///
/// Events are stably sorted by timestamp; runs of the same state merge and a
/// change of state closes the running interval at the new event's timestamp.
/// The last interval stays open only when `session_open`; otherwise it ends at
/// the last event's timestamp, which is a zero-length interval whenever that
/// last event changed state. Consecutive outputs always satisfy
/// `out[i].end == Some(out[i + 1].start)`.
#[must_use]
pub fn build(events: &[ActivityEvent], session_open: bool) -> Vec<BuiltInterval> {
    let mut sorted: Vec<&ActivityEvent> = events.iter().collect();
    sorted.sort_by_key(|event| event.timestamp);

    let Some((last, _)) = sorted.split_last() else {
        return Vec::new();
    };
    let last_timestamp = last.timestamp;

    let mut out: Vec<BuiltInterval> = Vec::new();
    let mut current: Option<BuiltInterval> = None;

    for event in sorted {
        match current.as_mut() {
            Some(running) if running.state == event.state => {}
            Some(running) => {
                running.end = Some(event.timestamp);
                out.push(*running);
                current = Some(BuiltInterval {
                    state: event.state,
                    start: event.timestamp,
                    end: None,
                });
            }
            None => {
                current = Some(BuiltInterval {
                    state: event.state,
                    start: event.timestamp,
                    end: None,
                });
            }
        }
    }

    if let Some(mut running) = current {
        if !session_open {
            running.end = Some(last_timestamp);
        }
        out.push(running);
    }
    out
}

/// Attach driver and source metadata. An open interval is stamped with
/// `downloaded_at`, the last instant the file speaks for.
#[must_use]
pub fn into_activity_intervals(
    built: &[BuiltInterval],
    driver: &DriverId,
    source_file_id: &str,
    format: SourceFormat,
    downloaded_at: DateTime<Utc>,
) -> Vec<ActivityInterval> {
    built
        .iter()
        .map(|interval| ActivityInterval {
            driver_id: driver.clone(),
            state: interval.state,
            start_time: interval.start,
            end_time: interval.end,
            observed_until: interval.end.is_none().then_some(downloaded_at),
            source_file_id: source_file_id.to_string(),
            source_format: format,
        })
        .collect()
}
