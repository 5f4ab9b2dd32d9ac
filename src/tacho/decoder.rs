//! Single decode entry point over the two tachograph interchange formats.
//!
//! Both formats share one output contract: an ordered list of
//! [`ActivityEvent`]s plus record-level warnings. Header-level problems are
//! fatal and come back as `Err`; anything wrong with an individual record is
//! pushed to [`DecodedFile::warnings`] and decoding carries on.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::tacho::activity::{ActivityEvent, DriverSlot, SourceFormat};
use crate::tacho::{driver_card, vehicle_unit};

/// Decode failure or record-level anomaly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("[FFX-4001] bad magic: expected {expected:02x?}, found {found:02x?}")]
    BadMagic { expected: [u8; 2], found: Vec<u8> },

    #[error("[FFX-4002] unsupported layout version {version}")]
    UnsupportedLayout { version: u8 },

    #[error("[FFX-4003] truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("[FFX-4004] unknown activity code {code} at offset {offset}")]
    UnknownActivityCode { code: u8, offset: usize },

    #[error("[FFX-4005] malformed record at offset {offset}: {details}")]
    MalformedRecord { offset: usize, details: String },
}

impl DecodeError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadMagic { .. } => "FFX-4001",
            Self::UnsupportedLayout { .. } => "FFX-4002",
            Self::Truncated { .. } => "FFX-4003",
            Self::UnknownActivityCode { .. } => "FFX-4004",
            Self::MalformedRecord { .. } => "FFX-4005",
        }
    }
}

/// Everything read out of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFile {
    pub events: Vec<ActivityEvent>,
    pub warnings: Vec<DecodeError>,
    /// The recorder was still in a session when the file was downloaded.
    pub session_open: bool,
    pub card_number: Option<String>,
    pub vehicle_registration: Option<String>,
}

/// Decode `bytes` as `format`, keeping only events for `slot`.
///
/// Driver card files describe a single driver; `slot` only filters
/// vehicle unit records.
pub fn decode(
    bytes: &[u8],
    format: SourceFormat,
    slot: DriverSlot,
) -> Result<DecodedFile, DecodeError> {
    match format {
        SourceFormat::DriverCard => driver_card::decode(bytes),
        SourceFormat::VehicleUnit => vehicle_unit::decode(bytes, slot),
    }
}

// ──────────────────── shared reading helpers ────────────────────

/// Big-endian cursor that reports short reads as [`DecodeError::Truncated`].
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) const fn offset(&self) -> usize {
        self.pos
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        if needed > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Fixed-width ASCII field with NUL/space padding stripped.
    pub(crate) fn ascii(&mut self, width: usize) -> Result<Option<String>, DecodeError> {
        let raw = self.take(width)?;
        Ok(padded_ascii(raw))
    }

    /// Check the two-byte signature at the current position.
    pub(crate) fn expect_magic(&mut self, expected: [u8; 2]) -> Result<(), DecodeError> {
        let available = self.remaining().min(2);
        let found = &self.bytes[self.pos..self.pos + available];
        if found != expected {
            if found.len() == 2 || !expected.starts_with(found) {
                return Err(DecodeError::BadMagic {
                    expected,
                    found: found.to_vec(),
                });
            }
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: 2,
                available,
            });
        }
        self.pos += 2;
        Ok(())
    }
}

pub(crate) fn padded_ascii(raw: &[u8]) -> Option<String> {
    let text: String = raw
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { ' ' })
        .collect();
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub(crate) fn unix_seconds(secs: i64, offset: usize) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| DecodeError::MalformedRecord {
        offset,
        details: format!("timestamp {secs} out of range"),
    })
}
