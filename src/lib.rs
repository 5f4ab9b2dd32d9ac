#![forbid(unsafe_code)]

//! Fleet Fusion (ffx): tachograph activity and GPS telemetry on one timeline.
//!
//! Two independent streams per driver/vehicle pair are brought together:
//! 1. **Tachograph activity**: driver card (`.ddd`) and vehicle unit (`.tgd`)
//!    downloads decoded into activity intervals and deduplicated across uploads
//! 2. **GPS telemetry**: position reports and pings folded into an append-only
//!    position log and a per-vehicle presence signal
//! 3. **Fusion**: activities joined with the positions of whichever vehicle the
//!    driver was assigned to at the time
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use fleet_fusion::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use fleet_fusion::core::config::Config;
//! use fleet_fusion::tacho::decoder::decode;
//! ```

pub mod prelude;

pub mod core;
pub mod fusion;
pub mod logger;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod tacho;
pub mod telemetry;
