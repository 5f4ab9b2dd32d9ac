//! Deduplicate candidate intervals against stored ones and insert the rest.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{FleetError, Result};
use crate::core::ids::DriverId;
use crate::reconcile::locks::KeyedLocks;
use crate::store::ActivityStore;
use crate::tacho::activity::{ActivityInterval, ActivityState};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub created: usize,
    /// Equal to, or containing/contained by, an interval already known.
    pub skipped: usize,
    /// Zero-length candidates, never persisted.
    pub rejected_empty: usize,
    pub warnings: Vec<String>,
    pub created_ids: Vec<i64>,
}

/// Per-driver serialized reconciler.
pub struct Reconciler {
    store: Arc<dyn ActivityStore>,
    locks: KeyedLocks<DriverId>,
}

impl Reconciler {
    #[must_use]
    pub fn new(store: Arc<dyn ActivityStore>, lock_timeout: Duration) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(lock_timeout),
        }
    }

    /// Reconcile one file's intervals for `driver`.
    ///
    /// The read-compare-insert sequence runs under the driver's key, and the
    /// accepted set is inserted all-or-nothing.
    pub fn reconcile(
        &self,
        driver: &DriverId,
        candidates: &[ActivityInterval],
    ) -> Result<ReconcileReport> {
        if let Some(foreign) = candidates.iter().find(|c| &c.driver_id != driver) {
            return Err(FleetError::InvalidInput {
                details: format!(
                    "interval for driver {} passed to reconcile for driver {driver}",
                    foreign.driver_id
                ),
            });
        }

        let mut report = ReconcileReport::default();
        let mut pending: Vec<&ActivityInterval> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.is_empty() {
                report.rejected_empty += 1;
            } else {
                pending.push(candidate);
            }
        }
        if pending.is_empty() {
            return Ok(report);
        }

        let _guard = self.locks.lock(driver)?;

        let pending_starts = sorted_starts(pending.iter().map(|c| c.start_time));
        let candidates: Vec<Span> = pending
            .iter()
            .map(|candidate| self.resolve(driver, candidate, &pending_starts))
            .collect::<Result<_>>()?;

        let range_start = candidates
            .iter()
            .map(|span| span.start)
            .min()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let range_end = candidates
            .iter()
            .map(|span| span.end)
            .max()
            .filter(|end| *end < DateTime::<Utc>::MAX_UTC);
        let stored = self
            .store
            .intervals_overlapping(driver, range_start, range_end)?;

        let mut known: Vec<Span> = stored
            .iter()
            .map(|row| self.resolve(driver, &row.interval, &[]))
            .collect::<Result<_>>()?;

        let mut accepted: Vec<ActivityInterval> = Vec::new();
        for (candidate, span) in pending.into_iter().zip(candidates) {
            if known.iter().any(|existing| existing.is_duplicate_of(&span)) {
                report.skipped += 1;
                continue;
            }
            let overlaps = known.iter().filter(|existing| existing.intersects(&span)).count();
            if overlaps > 0 {
                report.warnings.push(format!(
                    "{} interval starting {} partially overlaps {overlaps} known interval(s); stored as-is",
                    candidate.state,
                    candidate.start_time.to_rfc3339(),
                ));
            }
            known.push(span);
            accepted.push(candidate.clone());
        }

        if !accepted.is_empty() {
            report.created_ids = self.store.insert_intervals(&accepted)?;
            report.created = accepted.len();
        }
        Ok(report)
    }

    /// Span of `interval` for comparison. An open interval stops at its
    /// download time, the next stored start of the driver, or the next start
    /// in `local_starts`, whichever comes first.
    fn resolve(
        &self,
        driver: &DriverId,
        interval: &ActivityInterval,
        local_starts: &[DateTime<Utc>],
    ) -> Result<Span> {
        let end = if interval.is_open() {
            let local = local_starts
                .get(local_starts.partition_point(|start| *start <= interval.start_time))
                .copied();
            let stored = self.store.next_start_after(driver, interval.start_time)?;
            let next = match (local, stored) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            interval.bounded_end(next)
        } else {
            interval.end_time
        };
        Ok(Span {
            state: interval.state,
            start: interval.start_time,
            end: end.unwrap_or(DateTime::<Utc>::MAX_UTC),
        })
    }
}

fn sorted_starts(starts: impl IntoIterator<Item = DateTime<Utc>>) -> Vec<DateTime<Utc>> {
    let mut starts: Vec<DateTime<Utc>> = starts.into_iter().collect();
    starts.sort_unstable();
    starts
}

/// Resolved `[start, end)` of one interval. `end` is `MAX_UTC` only for an
/// open interval nothing bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    state: ActivityState,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Span {
    fn is_unbounded(&self) -> bool {
        self.end == DateTime::<Utc>::MAX_UTC
    }

    /// An unbounded span only contains spans that start with it.
    fn contains(&self, other: &Self) -> bool {
        self.start <= other.start
            && other.end <= self.end
            && (!self.is_unbounded() || self.start == other.start)
    }

    /// Same state, and one range equals or contains the other.
    fn is_duplicate_of(&self, other: &Self) -> bool {
        self.state == other.state && (self.contains(other) || other.contains(self))
    }

    fn intersects(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}
