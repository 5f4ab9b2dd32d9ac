//! Vehicle telemetry: position log, presence and fleet status.

pub mod ingestor;
pub mod presence;
