//! Driver→vehicle assignment timeline with binary-search lookup.

#![allow(missing_docs)]

use std::collections::BinaryHeap;
use std::iter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{DriverId, VehicleId};

/// A time-bound driver→vehicle assignment. `assigned_until == None` is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub driver_id: DriverId,
    pub vehicle_id: VehicleId,
    pub assigned_from: DateTime<Utc>,
    pub assigned_until: Option<DateTime<Utc>>,
}

impl Assignment {
    #[must_use]
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.assigned_from <= at && self.assigned_until.is_none_or(|until| at < until)
    }
}

/// A vehicle-homogeneous piece of a time span. `vehicle_id == None` means the
/// driver was not assigned to any vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineSpan {
    pub vehicle_id: Option<VehicleId>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Stretch of time during which one assignment is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Piece {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    assignment: usize,
}

impl Piece {
    fn covers(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && self.end.is_none_or(|end| at < end)
    }
}

/// One driver's assignments ordered by start time, with overlaps resolved
/// up front into disjoint pieces.
#[derive(Debug, Clone, Default)]
pub struct AssignmentTimeline {
    assignments: Vec<Assignment>,
    pieces: Vec<Piece>,
}

impl AssignmentTimeline {
    #[must_use]
    pub fn new(mut assignments: Vec<Assignment>) -> Self {
        assignments.sort_by_key(|a| a.assigned_from);
        let pieces = resolve_overlaps(&assignments);
        Self {
            assignments,
            pieces,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Assignment in force at `at`. When assignments overlap the one that
    /// started last wins.
    #[must_use]
    pub fn active_at(&self, at: DateTime<Utc>) -> Option<&Assignment> {
        self.piece_at(at).map(|piece| &self.assignments[piece.assignment])
    }

    fn piece_at(&self, at: DateTime<Utc>) -> Option<&Piece> {
        let started = self.pieces.partition_point(|p| p.start <= at);
        started
            .checked_sub(1)
            .map(|idx| &self.pieces[idx])
            .filter(|piece| piece.covers(at))
    }

    /// Split `[start, end)` into vehicle-homogeneous spans covering it exactly.
    #[must_use]
    pub fn split(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimelineSpan> {
        let mut spans: Vec<TimelineSpan> = Vec::new();
        let mut cursor = start;

        while cursor < end {
            let (vehicle_id, span_end) = match self.piece_at(cursor) {
                Some(piece) => (
                    Some(self.assignments[piece.assignment].vehicle_id.clone()),
                    piece.end.map_or(end, |until| until.min(end)),
                ),
                None => {
                    let next = self.pieces.partition_point(|p| p.start <= cursor);
                    let next_start = self.pieces.get(next).map(|p| p.start);
                    (None, next_start.map_or(end, |t| t.min(end)))
                }
            };

            match spans.last_mut() {
                Some(prev) if prev.vehicle_id == vehicle_id => prev.end = span_end,
                _ => spans.push(TimelineSpan {
                    vehicle_id,
                    start: cursor,
                    end: span_end,
                }),
            }
            cursor = span_end;
        }
        spans
    }
}

/// Sweep the start/end boundaries of `assignments` (sorted by start) and
/// record which assignment wins between each pair. Among the assignments
/// covering a boundary the latest start wins; equal starts go to the later
/// entry.
fn resolve_overlaps(assignments: &[Assignment]) -> Vec<Piece> {
    let mut bounds: Vec<DateTime<Utc>> = assignments
        .iter()
        .flat_map(|a| iter::once(a.assigned_from).chain(a.assigned_until))
        .collect();
    bounds.sort_unstable();
    bounds.dedup();

    let mut candidates: BinaryHeap<(DateTime<Utc>, usize)> = BinaryHeap::new();
    let mut pending = 0;
    let mut pieces: Vec<Piece> = Vec::new();

    for (i, &at) in bounds.iter().enumerate() {
        while let Some(next) = assignments.get(pending).filter(|a| a.assigned_from <= at) {
            candidates.push((next.assigned_from, pending));
            pending += 1;
        }
        // Anything that no longer covers `at` never will again.
        while let Some(&(_, idx)) = candidates.peek() {
            if assignments[idx].covers(at) {
                break;
            }
            candidates.pop();
        }
        let Some(&(_, winner)) = candidates.peek() else {
            continue;
        };

        let end = bounds.get(i + 1).copied();
        match pieces.last_mut() {
            Some(prev) if prev.assignment == winner && prev.end == Some(at) => prev.end = end,
            _ => pieces.push(Piece {
                start: at,
                end,
                assignment: winner,
            }),
        }
    }
    pieces
}
