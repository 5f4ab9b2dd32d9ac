//! Activity store reconciliation: duplicate suppression under per-driver locks.

pub mod locks;
pub mod reconciler;
