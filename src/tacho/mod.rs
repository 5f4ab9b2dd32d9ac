//! Tachograph file decoding and activity interval building.

pub mod activity;
pub mod decoder;
pub mod driver_card;
pub mod intervals;
pub mod vehicle_unit;

use sha2::{Digest, Sha256};

/// Hex SHA-256 of an uploaded file; identifies the source of its intervals.
#[must_use]
pub fn source_file_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
