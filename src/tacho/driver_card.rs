//! DRIVER_CARD (`.ddd`) decoding: a per-minute activity array anchored to a
//! base timestamp, either bit-packed (layout 1) or run-length encoded
//! (layout 2).
//!
//! Header, big-endian:
//!
//! ```text
//! 0   magic 0x76 0x01
//! 2   layout version
//! 3   flags (reserved)
//! 4   base timestamp, unix seconds
//! 8   card number, 16 bytes ASCII
//! 24  count: minutes (layout 1) or runs (layout 2)
//! 26  body
//! ```

#![allow(missing_docs)]

use chrono::{DateTime, Utc};

use crate::tacho::activity::{ActivityEvent, ActivityState, DriverSlot};
use crate::tacho::decoder::{ByteReader, DecodeError, DecodedFile, unix_seconds};

pub const MAGIC: [u8; 2] = [0x76, 0x01];
pub const LAYOUT_PACKED: u8 = 1;
pub const LAYOUT_RUN_LENGTH: u8 = 2;
pub const HEADER_LEN: usize = 26;
pub const CARD_NUMBER_LEN: usize = 16;
const RUN_LEN: usize = 3;

/// Emits one event per state transition plus a closing event that repeats the
/// final state at the end of the recording.
struct TransitionWalker {
    base: i64,
    last: Option<ActivityState>,
    events: Vec<ActivityEvent>,
}

impl TransitionWalker {
    const fn new(base: i64) -> Self {
        Self {
            base,
            last: None,
            events: Vec::new(),
        }
    }

    fn at_minute(&self, minute: u64, offset: usize) -> Result<DateTime<Utc>, DecodeError> {
        let secs = i64::try_from(minute)
            .ok()
            .and_then(|m| m.checked_mul(60))
            .and_then(|s| s.checked_add(self.base))
            .ok_or_else(|| DecodeError::MalformedRecord {
                offset,
                details: format!("minute {minute} overflows the timeline"),
            })?;
        unix_seconds(secs, offset)
    }

    fn observe(
        &mut self,
        state: ActivityState,
        minute: u64,
        offset: usize,
    ) -> Result<(), DecodeError> {
        if self.last != Some(state) {
            let timestamp = self.at_minute(minute, offset)?;
            self.events.push(ActivityEvent {
                slot: DriverSlot::Primary,
                timestamp,
                state,
            });
            self.last = Some(state);
        }
        Ok(())
    }

    fn finish(mut self, total_minutes: u64, offset: usize) -> Result<Vec<ActivityEvent>, DecodeError> {
        if let Some(state) = self.last {
            let timestamp = self.at_minute(total_minutes, offset)?;
            self.events.push(ActivityEvent {
                slot: DriverSlot::Primary,
                timestamp,
                state,
            });
        }
        Ok(self.events)
    }
}

pub fn decode(bytes: &[u8]) -> Result<DecodedFile, DecodeError> {
    let mut reader = ByteReader::new(bytes);
    reader.expect_magic(MAGIC)?;
    let version = reader.u8()?;
    if version != LAYOUT_PACKED && version != LAYOUT_RUN_LENGTH {
        return Err(DecodeError::UnsupportedLayout { version });
    }
    let _flags = reader.u8()?;
    let base = i64::from(reader.u32()?);
    let card_number = reader.ascii(CARD_NUMBER_LEN)?;
    let count = reader.u16()?;

    let mut warnings = Vec::new();
    let events = if version == LAYOUT_PACKED {
        decode_packed(&mut reader, base, count)?
    } else {
        decode_runs(&mut reader, base, count, &mut warnings)?
    };

    Ok(DecodedFile {
        events,
        warnings,
        session_open: false,
        card_number,
        vehicle_registration: None,
    })
}

/// Layout 1: `ceil(count / 4)` bytes of 2-bit codes, most significant pair first.
fn decode_packed(
    reader: &mut ByteReader<'_>,
    base: i64,
    minutes: u16,
) -> Result<Vec<ActivityEvent>, DecodeError> {
    let body_offset = reader.offset();
    let body = reader.take(usize::from(minutes).div_ceil(4))?;
    let mut walker = TransitionWalker::new(base);

    for minute in 0..usize::from(minutes) {
        let byte = body[minute / 4];
        let shift = 6 - 2 * (minute % 4);
        let code = (byte >> shift) & 0b11;
        // Every 2-bit value is a defined code.
        let Some(state) = ActivityState::from_code(code) else {
            continue;
        };
        walker.observe(state, minute as u64, body_offset + minute / 4)?;
    }

    walker.finish(u64::from(minutes), body_offset)
}

/// Layout 2: `count` runs of `code: u8, minutes: u16`.
fn decode_runs(
    reader: &mut ByteReader<'_>,
    base: i64,
    runs: u16,
    warnings: &mut Vec<DecodeError>,
) -> Result<Vec<ActivityEvent>, DecodeError> {
    let body_offset = reader.offset();
    let body = reader.take(usize::from(runs) * RUN_LEN)?;
    let mut walker = TransitionWalker::new(base);
    let mut elapsed: u64 = 0;

    for (index, run) in body.chunks_exact(RUN_LEN).enumerate() {
        let offset = body_offset + index * RUN_LEN;
        let code = run[0];
        let minutes = u64::from(u16::from_be_bytes([run[1], run[2]]));
        match ActivityState::from_code(code) {
            Some(state) if minutes > 0 => walker.observe(state, elapsed, offset)?,
            Some(_) => {}
            None => warnings.push(DecodeError::UnknownActivityCode { code, offset }),
        }
        elapsed += minutes;
    }

    walker.finish(elapsed, body_offset + body.len())
}
