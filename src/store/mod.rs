//! Storage seams consumed by the reconciler, the ingestor and fusion.
//!
//! The surrounding fleet system owns durable storage, the assignment history
//! and driver/vehicle records. These traits are the whole of what this crate
//! needs from it. [`memory::MemoryStore`] and (with the `sqlite` feature)
//! [`sqlite::SqliteStore`] implement all of them.

#![allow(missing_docs)]

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::core::ids::{DriverId, VehicleId};
use crate::fusion::assignment::Assignment;
use crate::tacho::activity::{ActivityInterval, ActivityState, StoredInterval};
use crate::telemetry::presence::{GpsPosition, IngestOutcome, VehiclePresence};

/// Filter for activity listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub state: Option<ActivityState>,
    pub limit: Option<usize>,
}

/// Positions of `vehicle_id` with `start <= timestamp < end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentQuery {
    pub vehicle_id: VehicleId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub trait ActivityStore: Send + Sync {
    /// Intervals of `driver` intersecting `[start, end)`, ordered by start.
    /// `end == None` leaves the range unbounded. An open stored interval
    /// reaches its download time, or never ends when none was recorded.
    fn intervals_overlapping(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredInterval>>;

    /// Earliest start of any stored interval of `driver` strictly after `after`.
    fn next_start_after(
        &self,
        driver: &DriverId,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Insert all of `intervals` or none of them. Returns the new row ids.
    fn insert_intervals(&self, intervals: &[ActivityInterval]) -> Result<Vec<i64>>;

    /// Intervals of `driver` matching `query`, newest first.
    fn list_intervals(&self, driver: &DriverId, query: &ActivityQuery)
    -> Result<Vec<StoredInterval>>;
}

pub trait PositionStore: Send + Sync {
    /// Append `position` and fold it into the vehicle's presence as one
    /// atomic unit scoped to that vehicle.
    fn record(&self, position: &GpsPosition) -> Result<IngestOutcome>;

    /// Advance presence without logging a position.
    fn heartbeat(&self, vehicle: &VehicleId, at: DateTime<Utc>) -> Result<IngestOutcome>;

    fn presence(&self, vehicle: &VehicleId) -> Result<Option<VehiclePresence>>;

    fn all_presence(&self) -> Result<Vec<VehiclePresence>>;

    /// Positions for each query, in timestamp order, read from one snapshot.
    fn positions_for_segments(&self, segments: &[SegmentQuery]) -> Result<Vec<Vec<GpsPosition>>>;

    /// Delete log entries older than `cutoff`. Presence is kept.
    fn prune_positions_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

pub trait AssignmentSource: Send + Sync {
    /// Assignments of `driver` intersecting `[start, end)`.
    fn assignments_for(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Assignment>>;
}

pub trait FleetDirectory: Send + Sync {
    fn driver_exists(&self, driver: &DriverId) -> Result<bool>;

    fn vehicle_exists(&self, vehicle: &VehicleId) -> Result<bool>;

    fn vehicle_ids(&self) -> Result<Vec<VehicleId>>;
}

/// Shared range predicate used by the store implementations.
pub(crate) fn interval_intersects(
    interval: &ActivityInterval,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> bool {
    let starts_before_end = end.is_none_or(|end| interval.start_time < end);
    let ends_after_start = interval.known_end().is_none_or(|own_end| own_end > start);
    starts_before_end && ends_after_start
}

pub(crate) fn assignment_intersects(
    assignment: &Assignment,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    assignment.assigned_from < end && assignment.assigned_until.is_none_or(|until| until > start)
}
