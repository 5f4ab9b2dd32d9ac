//! In-memory store implementing every storage seam.
//!
//! Positions and presence are kept per vehicle behind their own mutex so
//! ingestion for different vehicles never contends. All lock acquisitions are
//! bounded by the configured busy timeout.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::core::errors::{FleetError, Result};
use crate::core::ids::{DriverId, VehicleId};
use crate::fusion::assignment::Assignment;
use crate::store::{
    ActivityQuery, ActivityStore, AssignmentSource, FleetDirectory, PositionStore, SegmentQuery,
    assignment_intersects, interval_intersects,
};
use crate::tacho::activity::{ActivityInterval, StoredInterval};
use crate::telemetry::presence::{GpsPosition, IngestOutcome, VehiclePresence};

#[derive(Debug, Default)]
struct ActivityTable {
    next_id: i64,
    rows: Vec<StoredInterval>,
}

#[derive(Debug, Default)]
struct VehicleLog {
    positions: Vec<GpsPosition>,
    presence: Option<VehiclePresence>,
}

#[derive(Debug, Default)]
struct Directory {
    drivers: BTreeSet<DriverId>,
    vehicles: BTreeSet<VehicleId>,
}

/// Thread-safe in-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    busy_timeout: Duration,
    activities: RwLock<ActivityTable>,
    vehicles: RwLock<BTreeMap<VehicleId, Arc<Mutex<VehicleLog>>>>,
    assignments: RwLock<Vec<Assignment>>,
    directory: RwLock<Directory>,
    fail_next_insert: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new(busy_timeout: Duration) -> Self {
        Self {
            busy_timeout,
            activities: RwLock::new(ActivityTable {
                next_id: 1,
                rows: Vec::new(),
            }),
            vehicles: RwLock::new(BTreeMap::new()),
            assignments: RwLock::new(Vec::new()),
            directory: RwLock::new(Directory::default()),
            fail_next_insert: AtomicBool::new(false),
        }
    }

    /// Make the next `insert_intervals` call fail after staging its rows.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    pub fn register_driver(&self, driver: DriverId) {
        self.directory.write().drivers.insert(driver);
    }

    pub fn register_vehicle(&self, vehicle: VehicleId) {
        self.directory.write().vehicles.insert(vehicle);
    }

    pub fn record_assignment(&self, assignment: Assignment) {
        self.assignments.write().push(assignment);
    }

    /// Full position log of one vehicle in arrival order.
    pub fn position_log(&self, vehicle: &VehicleId) -> Result<Vec<GpsPosition>> {
        let Some(log) = self.vehicles.read().get(vehicle).cloned() else {
            return Ok(Vec::new());
        };
        let guard = self.lock_vehicle(&log, "position_log")?;
        Ok(guard.positions.clone())
    }

    pub fn interval_count(&self) -> usize {
        self.activities.read().rows.len()
    }

    /// Run `work` while this thread holds `vehicle`'s log.
    #[cfg(test)]
    pub(crate) fn while_vehicle_held<R>(
        &self,
        vehicle: &VehicleId,
        work: impl FnOnce() -> R,
    ) -> Result<R> {
        let entry = self.vehicle_entry(vehicle)?;
        let _held = self.lock_vehicle(&entry, "while_vehicle_held")?;
        Ok(work())
    }

    fn timeout_error(&self, context: &'static str) -> FleetError {
        FleetError::StorageTimeout {
            context,
            waited_ms: u64::try_from(self.busy_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn lock_vehicle<'a>(
        &self,
        log: &'a Arc<Mutex<VehicleLog>>,
        context: &'static str,
    ) -> Result<MutexGuard<'a, VehicleLog>> {
        log.try_lock_for(self.busy_timeout)
            .ok_or_else(|| self.timeout_error(context))
    }

    fn vehicle_entry(&self, vehicle: &VehicleId) -> Result<Arc<Mutex<VehicleLog>>> {
        if let Some(log) = self.vehicles.read().get(vehicle) {
            return Ok(Arc::clone(log));
        }
        let mut vehicles = self
            .vehicles
            .try_write_for(self.busy_timeout)
            .ok_or_else(|| self.timeout_error("vehicle_entry"))?;
        Ok(Arc::clone(vehicles.entry(vehicle.clone()).or_default()))
    }
}

impl ActivityStore for MemoryStore {
    fn intervals_overlapping(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredInterval>> {
        let table = self
            .activities
            .try_read_for(self.busy_timeout)
            .ok_or_else(|| self.timeout_error("intervals_overlapping"))?;
        let mut out: Vec<StoredInterval> = table
            .rows
            .iter()
            .filter(|row| &row.interval.driver_id == driver)
            .filter(|row| interval_intersects(&row.interval, start, end))
            .cloned()
            .collect();
        out.sort_by_key(|row| (row.interval.start_time, row.id));
        Ok(out)
    }

    fn next_start_after(
        &self,
        driver: &DriverId,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let table = self
            .activities
            .try_read_for(self.busy_timeout)
            .ok_or_else(|| self.timeout_error("next_start_after"))?;
        Ok(table
            .rows
            .iter()
            .filter(|row| &row.interval.driver_id == driver && row.interval.start_time > after)
            .map(|row| row.interval.start_time)
            .min())
    }

    fn insert_intervals(&self, intervals: &[ActivityInterval]) -> Result<Vec<i64>> {
        let mut table = self
            .activities
            .try_write_for(self.busy_timeout)
            .ok_or_else(|| self.timeout_error("insert_intervals"))?;

        let mut next_id = table.next_id;
        let staged: Vec<StoredInterval> = intervals
            .iter()
            .map(|interval| {
                let row = StoredInterval {
                    id: next_id,
                    interval: interval.clone(),
                };
                next_id += 1;
                row
            })
            .collect();

        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(FleetError::Storage {
                context: "insert_intervals",
                details: format!("injected failure after staging {} rows", staged.len()),
            });
        }

        let ids = staged.iter().map(|row| row.id).collect();
        table.rows.extend(staged);
        table.next_id = next_id;
        Ok(ids)
    }

    fn list_intervals(
        &self,
        driver: &DriverId,
        query: &ActivityQuery,
    ) -> Result<Vec<StoredInterval>> {
        let start = query.start.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut rows = self.intervals_overlapping(driver, start, query.end)?;
        if let Some(state) = query.state {
            rows.retain(|row| row.interval.state == state);
        }
        rows.reverse();
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

impl PositionStore for MemoryStore {
    fn record(&self, position: &GpsPosition) -> Result<IngestOutcome> {
        let entry = self.vehicle_entry(&position.vehicle_id)?;
        let mut log = self.lock_vehicle(&entry, "record")?;
        log.positions.push(position.clone());
        let outcome = match log.presence.as_mut() {
            Some(presence) => presence.apply_position(position),
            None => {
                let mut presence =
                    VehiclePresence::first_seen(position.vehicle_id.clone(), position.timestamp);
                let outcome = presence.apply_position(position);
                log.presence = Some(presence);
                outcome
            }
        };
        Ok(outcome)
    }

    fn heartbeat(&self, vehicle: &VehicleId, at: DateTime<Utc>) -> Result<IngestOutcome> {
        let entry = self.vehicle_entry(vehicle)?;
        let mut log = self.lock_vehicle(&entry, "heartbeat")?;
        let outcome = match log.presence.as_mut() {
            Some(presence) => presence.apply_heartbeat(at),
            None => {
                log.presence = Some(VehiclePresence::first_seen(vehicle.clone(), at));
                IngestOutcome::Advanced
            }
        };
        Ok(outcome)
    }

    fn presence(&self, vehicle: &VehicleId) -> Result<Option<VehiclePresence>> {
        let Some(entry) = self.vehicles.read().get(vehicle).cloned() else {
            return Ok(None);
        };
        let log = self.lock_vehicle(&entry, "presence")?;
        Ok(log.presence.clone())
    }

    fn all_presence(&self) -> Result<Vec<VehiclePresence>> {
        let entries: Vec<Arc<Mutex<VehicleLog>>> = self.vehicles.read().values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(presence) = self.lock_vehicle(entry, "all_presence")?.presence.clone() {
                out.push(presence);
            }
        }
        Ok(out)
    }

    fn positions_for_segments(&self, segments: &[SegmentQuery]) -> Result<Vec<Vec<GpsPosition>>> {
        // Hold every involved vehicle at once so all segments see one snapshot.
        let involved: BTreeSet<&VehicleId> = segments.iter().map(|s| &s.vehicle_id).collect();
        let entries: Vec<(&VehicleId, Arc<Mutex<VehicleLog>>)> = {
            let vehicles = self.vehicles.read();
            involved
                .into_iter()
                .filter_map(|id| vehicles.get(id).map(|log| (id, Arc::clone(log))))
                .collect()
        };
        let mut guards = BTreeMap::new();
        for (id, entry) in &entries {
            guards.insert(*id, self.lock_vehicle(entry, "positions_for_segments")?);
        }

        let out = segments
            .iter()
            .map(|segment| {
                let Some(log) = guards.get(&segment.vehicle_id) else {
                    return Vec::new();
                };
                let mut positions: Vec<GpsPosition> = log
                    .positions
                    .iter()
                    .filter(|p| segment.start <= p.timestamp && p.timestamp < segment.end)
                    .cloned()
                    .collect();
                positions.sort_by_key(|p| p.timestamp);
                positions
            })
            .collect();
        Ok(out)
    }

    fn prune_positions_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let entries: Vec<Arc<Mutex<VehicleLog>>> = self.vehicles.read().values().cloned().collect();
        let mut removed = 0u64;
        for entry in &entries {
            let mut log = self.lock_vehicle(entry, "prune_positions_before")?;
            let before = log.positions.len();
            log.positions.retain(|p| p.timestamp >= cutoff);
            removed += (before - log.positions.len()) as u64;
        }
        Ok(removed)
    }
}

impl AssignmentSource for MemoryStore {
    fn assignments_for(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Assignment>> {
        let assignments = self
            .assignments
            .try_read_for(self.busy_timeout)
            .ok_or_else(|| self.timeout_error("assignments_for"))?;
        let mut out: Vec<Assignment> = assignments
            .iter()
            .filter(|a| &a.driver_id == driver && assignment_intersects(a, start, end))
            .cloned()
            .collect();
        out.sort_by_key(|a| a.assigned_from);
        Ok(out)
    }
}

impl FleetDirectory for MemoryStore {
    fn driver_exists(&self, driver: &DriverId) -> Result<bool> {
        Ok(self.directory.read().drivers.contains(driver))
    }

    fn vehicle_exists(&self, vehicle: &VehicleId) -> Result<bool> {
        Ok(self.directory.read().vehicles.contains(vehicle))
    }

    fn vehicle_ids(&self) -> Result<Vec<VehicleId>> {
        Ok(self.directory.read().vehicles.iter().cloned().collect())
    }
}
