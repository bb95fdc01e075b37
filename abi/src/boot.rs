// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layout of the passive bootloader handoff blob (spec §6).
//!
//! The kernel core never constructs this blob; it only validates and reads
//! one handed to it at entry. The layout is a fixed header followed by a
//! sequence of tagged, variably-sized records.

use zerocopy::{AsBytes, FromBytes};

use crate::Error;

/// `b"ORION\0\0\0"` read as a big-endian `u64`.
pub const HANDOFF_MAGIC: u64 = 0x4F52_494F_4E00_0000;

pub const MIN_SUPPORTED_VERSION: u32 = 1;
pub const MAX_SUPPORTED_VERSION: u32 = 1;

/// Fixed header at the start of the handoff blob. `FromBytes`/`AsBytes` let
/// boot code read and rewrite it in place rather than through manual
/// byte-slicing; every field is plain-old-data so the derive is sound.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes)]
#[repr(C)]
pub struct HandoffHeader {
    pub magic: u64,
    pub version: u32,
    pub total_size: u32,
    pub record_count: u32,
    /// 32-bit additive checksum over this header with `header_checksum`
    /// itself treated as zero.
    pub header_checksum: u32,
    /// 32-bit additive checksum over the record bytes that follow the
    /// header.
    pub data_checksum: u32,
}

impl HandoffHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Tag identifying the kind of a handoff record.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum RecordTag {
    MemoryMap = 1,
    BootloaderInfo = 2,
    EfiSystemTable = 3,
}

impl RecordTag {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::MemoryMap,
            2 => Self::BootloaderInfo,
            3 => Self::EfiSystemTable,
            _ => return None,
        })
    }
}

/// Per-record header; `size` covers this header plus the record's payload
/// bytes and is what structural validation sums against `total_size`.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes)]
#[repr(C)]
pub struct RecordHeader {
    pub tag: u32,
    pub size: u32,
}

impl RecordHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

/// Computes the spec's 32-bit additive checksum (wrapping sum of `u32`
/// words) over a byte slice whose length must be a multiple of 4.
pub fn additive_checksum32(bytes: &[u8]) -> u32 {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .fold(0u32, |acc, w| acc.wrapping_add(w))
}

/// Validates a raw handoff blob's header and per-record structural
/// consistency: magic, version range, both checksums, and that the sum of
/// record sizes equals `total_size`. Does not interpret record payloads —
/// that is left to the (out-of-scope) consumer of each record kind.
///
/// On any mismatch this returns `Err`, which the caller (kernel boot code)
/// must treat as fatal per spec §6/§7.
pub fn validate(blob: &[u8]) -> Result<HandoffHeader, Error> {
    if blob.len() < HandoffHeader::SIZE {
        return Err(Error::InvalidArgument);
    }

    let header = read_header(blob);

    if header.magic != HANDOFF_MAGIC {
        return Err(Error::InvalidArgument);
    }
    if header.version < MIN_SUPPORTED_VERSION
        || header.version > MAX_SUPPORTED_VERSION
    {
        return Err(Error::InvalidArgument);
    }
    if header.total_size as usize != blob.len() {
        return Err(Error::InvalidArgument);
    }

    // Checksum the header with `header_checksum` zeroed, per spec.
    let mut header_bytes = [0u8; HandoffHeader::SIZE];
    header_bytes.copy_from_slice(&blob[..HandoffHeader::SIZE]);
    header_bytes[16..20].copy_from_slice(&0u32.to_le_bytes());
    if additive_checksum32(&header_bytes) != header.header_checksum {
        return Err(Error::InvalidArgument);
    }

    let data = &blob[HandoffHeader::SIZE..];
    if additive_checksum32(data) != header.data_checksum {
        return Err(Error::InvalidArgument);
    }

    // Walk records, confirming the tag sequence is well-formed and that
    // the sum of record sizes matches the remaining blob length exactly.
    let mut offset = 0usize;
    let mut seen = 0u32;
    while offset < data.len() {
        if data.len() - offset < RecordHeader::SIZE {
            return Err(Error::InvalidArgument);
        }
        let rec = read_record_header(&data[offset..]);
        if RecordTag::from_raw(rec.tag).is_none() {
            return Err(Error::InvalidArgument);
        }
        let size = rec.size as usize;
        if size < RecordHeader::SIZE || offset + size > data.len() {
            return Err(Error::InvalidArgument);
        }
        offset += size;
        seen += 1;
    }
    if offset != data.len() || seen != header.record_count {
        return Err(Error::InvalidArgument);
    }

    Ok(header)
}

// Every target this blob is handed off on is little-endian, same as the
// values `additive_checksum32` already assumes when summing raw words, so a
// native-endian `FromBytes` read matches the wire format without an
// explicit byte swap.
fn read_header(blob: &[u8]) -> HandoffHeader {
    HandoffHeader::read_from(&blob[..HandoffHeader::SIZE]).expect("length checked by caller")
}

fn read_record_header(bytes: &[u8]) -> RecordHeader {
    RecordHeader::read_from(&bytes[..RecordHeader::SIZE]).expect("length checked by caller")
}
