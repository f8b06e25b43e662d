//! Table binary format: fixed-size records followed by a trailer.
//!
//! ```text
//! [RECORDS] count x { stream_hash: u64 LE | event_number: i64 LE | log_position: i64 LE }
//! [TRAILER] entry_count: u64 LE | format_version: u8 | checksum: u64 LE
//! ```
//!
//! The checksum is XXH3-64 over every byte that precedes it (records,
//! entry count and version byte). Records are sorted ascending by
//! `(stream_hash, event_number)` with no duplicate keys.

use byteorder::{ByteOrder, LittleEndian};
use memtable::IndexEntry;

use crate::{PTableError, Result};

/// Table version storing 32-bit stream hashes in the low half of the hash field.
pub const PTABLE_VERSION_32BIT: u8 = 1;

/// Table version storing full 64-bit stream hashes.
pub const PTABLE_VERSION_64BIT: u8 = 2;

/// Version written by default.
pub const CURRENT_VERSION: u8 = PTABLE_VERSION_64BIT;

/// Size of one record: 8 (`stream_hash`) + 8 (`event_number`) + 8 (`log_position`).
pub const RECORD_SIZE: u64 = 24;

/// Size of the trailer: 8 (`entry_count`) + 1 (`version`) + 8 (`checksum`).
pub const TRAILER_SIZE: u64 = 8 + 1 + 8;

/// Bytes covered by the checksum in a trailer.
pub(crate) const CHECKED_TRAILER_PREFIX: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub entry_count: u64,
    pub version: u8,
    pub checksum: u64,
}

impl Trailer {
    pub(crate) fn encode(&self) -> [u8; TRAILER_SIZE as usize] {
        let mut buf = [0u8; TRAILER_SIZE as usize];
        LittleEndian::write_u64(&mut buf[0..8], self.entry_count);
        buf[8] = self.version;
        LittleEndian::write_u64(&mut buf[9..17], self.checksum);
        buf
    }

    pub(crate) fn decode(buf: &[u8; TRAILER_SIZE as usize]) -> Self {
        Self {
            entry_count: LittleEndian::read_u64(&buf[0..8]),
            version: buf[8],
            checksum: LittleEndian::read_u64(&buf[9..17]),
        }
    }
}

pub(crate) fn encode_record(e: &IndexEntry, buf: &mut [u8; RECORD_SIZE as usize]) {
    LittleEndian::write_u64(&mut buf[0..8], e.stream_hash);
    LittleEndian::write_i64(&mut buf[8..16], e.event_number);
    LittleEndian::write_i64(&mut buf[16..24], e.log_position);
}

pub(crate) fn decode_record(buf: &[u8; RECORD_SIZE as usize]) -> IndexEntry {
    IndexEntry::new(
        LittleEndian::read_u64(&buf[0..8]),
        LittleEndian::read_i64(&buf[8..16]),
        LittleEndian::read_i64(&buf[16..24]),
    )
}

/// Exact file length of a table holding `entry_count` records.
pub fn file_len_for(entry_count: u64) -> Option<u64> {
    entry_count
        .checked_mul(RECORD_SIZE)
        .and_then(|n| n.checked_add(TRAILER_SIZE))
}

pub fn check_version(version: u8) -> Result<()> {
    match version {
        PTABLE_VERSION_32BIT | PTABLE_VERSION_64BIT => Ok(()),
        other => Err(PTableError::UnsupportedVersion(other)),
    }
}
