//! Core types: errors, configuration, identifiers, time source.

pub mod clock;
pub mod config;
pub mod errors;
pub mod ids;
