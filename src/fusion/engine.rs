//! Fusion of stored activity intervals with the GPS log of whichever vehicle
//! the driver was assigned to at the time.
//!
//! Read-only: `fuse` never writes and may run concurrently with anything.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{FleetError, Result};
use crate::core::ids::{DriverId, VehicleId};
use crate::fusion::assignment::{AssignmentTimeline, TimelineSpan};
use crate::fusion::geo;
use crate::store::{ActivityStore, AssignmentSource, PositionStore, SegmentQuery};
use crate::tacho::activity::{ActivityState, StoredInterval};
use crate::telemetry::presence::GpsPosition;

/// A vehicle-homogeneous piece of one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSegment {
    /// `None` when the driver had no assignment during this piece.
    pub vehicle_id: Option<VehicleId>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub positions: Vec<GpsPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedActivity {
    pub interval: StoredInterval,
    pub segments: Vec<FusedSegment>,
    /// All segment positions in timestamp order.
    pub positions: Vec<GpsPosition>,
    pub distance_travelled_m: Option<f64>,
    pub average_speed_kmh: Option<f64>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub total_driving_minutes: i64,
    /// REST and BREAK together.
    pub total_rest_minutes: i64,
    pub total_work_minutes: i64,
    pub total_distance_m: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionReport {
    pub driver_id: DriverId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub activities: Vec<FusedActivity>,
    pub summary: ActivitySummary,
}

pub struct FusionEngine {
    activities: Arc<dyn ActivityStore>,
    positions: Arc<dyn PositionStore>,
    assignments: Arc<dyn AssignmentSource>,
}

impl FusionEngine {
    #[must_use]
    pub fn new(
        activities: Arc<dyn ActivityStore>,
        positions: Arc<dyn PositionStore>,
        assignments: Arc<dyn AssignmentSource>,
    ) -> Self {
        Self {
            activities,
            positions,
            assignments,
        }
    }

    /// Fuse every activity of `driver` overlapping `[start, end)`.
    pub fn fuse(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<FusionReport> {
        check_range(start, end)?;

        let (stored, spans) = self.effective_spans(driver, start, end)?;

        let timeline = match (
            spans.iter().map(|s| s.0).min(),
            spans.iter().map(|s| s.1).max(),
        ) {
            (Some(lo), Some(hi)) => {
                AssignmentTimeline::new(self.assignments.assignments_for(driver, lo, hi)?)
            }
            _ => AssignmentTimeline::default(),
        };

        let split: Vec<Vec<TimelineSpan>> = spans
            .iter()
            .map(|&(span_start, span_end)| timeline.split(span_start, span_end))
            .collect();

        // One snapshot read for every assigned segment of the query.
        let queries: Vec<SegmentQuery> = split
            .iter()
            .flatten()
            .filter_map(|span| {
                span.vehicle_id.as_ref().map(|vehicle| SegmentQuery {
                    vehicle_id: vehicle.clone(),
                    start: span.start,
                    end: span.end,
                })
            })
            .collect();
        let mut fetched = self.positions.positions_for_segments(&queries)?.into_iter();

        let mut activities = Vec::with_capacity(stored.len());
        let mut summary = ActivitySummary::default();
        for ((row, pieces), (span_start, span_end)) in stored.into_iter().zip(split).zip(spans) {
            add_minutes(&mut summary, row.interval.state, (span_end - span_start).num_minutes());
            let mut segments = Vec::with_capacity(pieces.len());
            let mut warnings = Vec::new();
            for span in pieces {
                let positions = if span.vehicle_id.is_some() {
                    fetched.next().unwrap_or_default()
                } else {
                    warnings.push(format!(
                        "no vehicle assignment for driver {driver} between {} and {}",
                        span.start.to_rfc3339(),
                        span.end.to_rfc3339()
                    ));
                    Vec::new()
                };
                segments.push(FusedSegment {
                    vehicle_id: span.vehicle_id,
                    start: span.start,
                    end: span.end,
                    positions,
                });
            }
            activities.push(fuse_activity(row, segments, warnings));
        }

        for activity in &activities {
            summary.total_distance_m += activity.distance_travelled_m.unwrap_or(0.0);
            summary.warnings.extend(activity.warnings.iter().cloned());
        }
        Ok(FusionReport {
            driver_id: driver.clone(),
            start,
            end,
            activities,
            summary,
        })
    }

    /// Minute totals of `driver`'s activities overlapping `[start, end)`,
    /// without touching the position log. Open intervals count up to their
    /// bounded end, never past `end`.
    pub fn activity_summary(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ActivitySummary> {
        check_range(start, end)?;
        let (stored, spans) = self.effective_spans(driver, start, end)?;
        let mut summary = ActivitySummary::default();
        for (row, (span_start, span_end)) in stored.iter().zip(spans) {
            add_minutes(&mut summary, row.interval.state, (span_end - span_start).num_minutes());
        }
        Ok(summary)
    }

    /// Rows overlapping `[start, end)` with the span each one covers.
    ///
    /// A closed interval keeps its own bounds. An open one runs to its
    /// download time or the driver's next stored start, clipped at `end`;
    /// rows whose bounded span ends at or before `start` are dropped.
    fn effective_spans(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<StoredInterval>, Vec<(DateTime<Utc>, DateTime<Utc>)>)> {
        let stored = self.activities.intervals_overlapping(driver, start, Some(end))?;
        let mut rows = Vec::with_capacity(stored.len());
        let mut spans = Vec::with_capacity(stored.len());
        for (index, row) in stored.iter().enumerate() {
            let interval = &row.interval;
            let span_end = if let Some(own_end) = interval.end_time {
                own_end
            } else {
                let next = match stored[index + 1..]
                    .iter()
                    .map(|later| later.interval.start_time)
                    .find(|later| *later > interval.start_time)
                {
                    Some(next) => Some(next),
                    None => self.activities.next_start_after(driver, interval.start_time)?,
                };
                let bounded = interval.bounded_end(next).map_or(end, |bound| bound.min(end));
                if bounded <= start {
                    continue;
                }
                bounded
            };
            rows.push(row.clone());
            spans.push((interval.start_time, span_end.max(interval.start_time)));
        }
        Ok((rows, spans))
    }
}

fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end <= start {
        return Err(FleetError::InvalidInput {
            details: format!(
                "query end {} is not after start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            ),
        });
    }
    Ok(())
}

fn fuse_activity(
    interval: StoredInterval,
    segments: Vec<FusedSegment>,
    warnings: Vec<String>,
) -> FusedActivity {
    let mut positions: Vec<GpsPosition> = segments
        .iter()
        .flat_map(|s| s.positions.iter().cloned())
        .collect();
    positions.sort_by_key(|p| p.timestamp);

    let (distance_travelled_m, average_speed_kmh) = if positions.is_empty() {
        (None, None)
    } else {
        // Legs never cross segment boundaries.
        let distance: f64 = segments.iter().map(|s| geo::path_length_m(&s.positions)).sum();
        let elapsed: f64 = segments.iter().map(|s| geo::elapsed_secs(&s.positions)).sum();
        let average = if elapsed > 0.0 {
            distance / elapsed * 3.6
        } else {
            geo::mean_reported_speed(&positions).unwrap_or(0.0)
        };
        (Some(distance), Some(average))
    };

    FusedActivity {
        interval,
        segments,
        positions,
        distance_travelled_m,
        average_speed_kmh,
        warnings,
    }
}

fn add_minutes(summary: &mut ActivitySummary, state: ActivityState, minutes: i64) {
    match state {
        ActivityState::Driving => summary.total_driving_minutes += minutes,
        ActivityState::Work => summary.total_work_minutes += minutes,
        s if s.counts_as_rest() => summary.total_rest_minutes += minutes,
        _ => {}
    }
}
