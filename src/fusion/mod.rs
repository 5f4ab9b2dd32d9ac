//! Fusion of tachograph activity with GPS telemetry.

pub mod assignment;
pub mod engine;
pub mod geo;
