//! VEHICLE_UNIT (`.tgd`) decoding: discrete change records, each with its own
//! absolute timestamp and card slot.
//!
//! Header, big-endian:
//!
//! ```text
//! 0   magic 0x76 0x03
//! 2   layout version (1)
//! 3   flags, bit 0 = session still open at download
//! 4   vehicle registration, 14 bytes ASCII
//! 18  record count
//! 20  records: len u8, then timestamp u32, slot u8, code u8, len-6 ignored bytes
//! ```

#![allow(missing_docs)]

use crate::tacho::activity::{ActivityEvent, ActivityState, DriverSlot};
use crate::tacho::decoder::{ByteReader, DecodeError, DecodedFile, unix_seconds};

pub const MAGIC: [u8; 2] = [0x76, 0x03];
pub const LAYOUT_V1: u8 = 1;
pub const FLAG_SESSION_OPEN: u8 = 0b0000_0001;
pub const HEADER_LEN: usize = 20;
pub const REGISTRATION_LEN: usize = 14;
/// Timestamp, slot and code.
pub const RECORD_MIN_LEN: usize = 6;

pub fn decode(bytes: &[u8], slot: DriverSlot) -> Result<DecodedFile, DecodeError> {
    let mut reader = ByteReader::new(bytes);
    reader.expect_magic(MAGIC)?;
    let version = reader.u8()?;
    if version != LAYOUT_V1 {
        return Err(DecodeError::UnsupportedLayout { version });
    }
    let flags = reader.u8()?;
    let vehicle_registration = reader.ascii(REGISTRATION_LEN)?;
    let count = reader.u16()?;

    let mut events = Vec::new();
    let mut warnings = Vec::new();

    for _ in 0..count {
        let offset = reader.offset();
        let len = usize::from(reader.u8()?);
        let record = reader.take(len)?;

        if len < RECORD_MIN_LEN {
            warnings.push(DecodeError::MalformedRecord {
                offset,
                details: format!("record length {len} below minimum {RECORD_MIN_LEN}"),
            });
            continue;
        }

        let secs = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let Some(record_slot) = DriverSlot::from_wire(record[4]) else {
            warnings.push(DecodeError::MalformedRecord {
                offset,
                details: format!("driver slot {} is neither 1 nor 2", record[4]),
            });
            continue;
        };
        if record_slot != slot {
            continue;
        }

        let code = record[5];
        let Some(state) = ActivityState::from_code(code) else {
            warnings.push(DecodeError::UnknownActivityCode {
                code,
                offset: offset + 1 + 5,
            });
            continue;
        };

        events.push(ActivityEvent {
            slot: record_slot,
            timestamp: unix_seconds(i64::from(secs), offset)?,
            state,
        });
    }

    Ok(DecodedFile {
        events,
        warnings,
        session_open: flags & FLAG_SESSION_OPEN != 0,
        card_number: None,
        vehicle_registration,
    })
}
