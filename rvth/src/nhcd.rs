//! NHCD bank table on-disk structures.
//!
//! The RVT-H Reader firmware keeps a directory of banks ("NHCD" table) at a
//! fixed LBA. The constants here describe the device layout and must match
//! the firmware byte-for-byte.

use std::mem::size_of;

use chrono::{DateTime, NaiveDateTime, Utc};
use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    common::MagicBytes,
    disc::MINI_DVD_SIZE,
    util::static_assert,
};

/// Magic bytes of the bank table header.
pub const NHCD_MAGIC: MagicBytes = *b"NHCD";

/// LBA of the bank table header. (byte offset 0x6000_0000)
pub const NHCD_BANKTABLE_ADDRESS_LBA: u32 = 0x30_0000;

/// Size of the bank table in LBAs: one header block plus up to 32 entry
/// blocks, rounded to the device's 32 KiB alignment.
pub const NHCD_BANKTABLE_SIZE_LBA: u32 = 0x40;

/// Size of a single bank in LBAs. (~4.38 GiB)
pub const NHCD_BANK_SIZE_LBA: u32 = 0x8C_4A00;

/// Size of a single-layer Wii RVT-R disc image in LBAs. Standalone images
/// longer than this are dual-layer.
pub const NHCD_BANK_WII_SL_SIZE_RVTR_LBA: u32 = 0x8C_4A00;

/// Size of a GameCube NR disc image in LBAs.
pub const NHCD_BANK_GCN_SIZE_NR_LBA: u32 = (MINI_DVD_SIZE / 512) as u32;

/// Maximum size of the first bank when an extended (>8 bank) table is in
/// use. Extended tables place bank 1 in the region below the bank table.
pub const NHCD_EXTBANKTABLE_BANK_1_SIZE_LBA: u32 =
    NHCD_BANKTABLE_ADDRESS_LBA - NHCD_EXTBANKTABLE_BANK_1_START_LBA;

/// Starting LBA of bank 1 on an extended bank table.
pub const NHCD_EXTBANKTABLE_BANK_1_START_LBA: u32 = 0x40;

/// On-disk bank type: empty slot.
pub const NHCD_BANK_TYPE_EMPTY: u32 = 0;
/// On-disk bank type: GameCube.
pub const NHCD_BANK_TYPE_GCN: u32 = 1;
/// On-disk bank type: Wii single-layer.
pub const NHCD_BANK_TYPE_WII_SL: u32 = 2;
/// On-disk bank type: Wii dual-layer.
pub const NHCD_BANK_TYPE_WII_DL: u32 = 3;

/// Computes the starting LBA of a bank's data area.
///
/// Standard tables lay all banks out after the table. Extended tables
/// additionally use the region below the table for bank 1, which is why
/// that bank has a smaller size cap.
pub fn bank_start_lba(bank: u32, bank_count: u32) -> u32 {
    if bank_count > 8 {
        if bank == 0 {
            NHCD_EXTBANKTABLE_BANK_1_START_LBA
        } else {
            NHCD_BANKTABLE_ADDRESS_LBA + NHCD_BANKTABLE_SIZE_LBA + (bank - 1) * NHCD_BANK_SIZE_LBA
        }
    } else {
        NHCD_BANKTABLE_ADDRESS_LBA + NHCD_BANKTABLE_SIZE_LBA + bank * NHCD_BANK_SIZE_LBA
    }
}

/// Maximum length in LBAs of a single bank slot.
pub fn bank_max_len_lba(bank: u32, bank_count: u32) -> u32 {
    if bank_count > 8 && bank == 0 {
        NHCD_EXTBANKTABLE_BANK_1_SIZE_LBA
    } else {
        NHCD_BANK_SIZE_LBA
    }
}

/// Bank table header block.
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct NhcdHeader {
    /// Magic, always "NHCD"
    pub magic: MagicBytes,
    /// Number of banks on the device
    pub bank_count: U32,
    _reserved: [u8; 504],
}

static_assert!(size_of::<NhcdHeader>() == 512);

impl NhcdHeader {
    /// Creates a header block for a table with the given bank count.
    pub fn new(bank_count: u32) -> Self {
        Self { magic: NHCD_MAGIC, bank_count: U32::new(bank_count), _reserved: [0; 504] }
    }
}

/// Bank table entry block. One per bank slot, directly after the header.
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct NhcdBankEntry {
    /// Bank type (NHCD_BANK_TYPE_*)
    pub bank_type: U32,
    /// Disc revision (BCD)
    pub revision: u8,
    /// Region code
    pub region: u8,
    /// Wii encryption flag: 0 = encrypted, 1 = unencrypted
    pub wii_crypto: u8,
    _pad0: u8,
    /// Starting LBA of the bank's data
    pub lba_start: U32,
    /// Length of the image in LBAs
    pub lba_len: U32,
    /// Timestamp, ASCII "YYYYMMDDhhmmss"; all zeroes when unset
    pub timestamp: [u8; 14],
    _reserved: [u8; 482],
}

static_assert!(size_of::<NhcdBankEntry>() == 512);

impl NhcdBankEntry {
    /// Decodes the ASCII timestamp into seconds since the epoch.
    /// Returns -1 when the field is unset or malformed.
    pub fn timestamp_unix(&self) -> i64 {
        let Ok(s) = std::str::from_utf8(&self.timestamp) else { return -1 };
        match NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S") {
            Ok(dt) => dt.and_utc().timestamp(),
            Err(_) => -1,
        }
    }

    /// Encodes a unix timestamp into the ASCII field. Negative timestamps
    /// clear the field.
    pub fn set_timestamp_unix(&mut self, ts: i64) {
        if ts < 0 {
            self.timestamp = [0; 14];
            return;
        }
        match DateTime::<Utc>::from_timestamp(ts, 0) {
            Some(dt) => {
                let s = dt.format("%Y%m%d%H%M%S").to_string();
                self.timestamp.copy_from_slice(s.as_bytes());
            }
            None => self.timestamp = [0; 14],
        }
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromZeros;

    use super::*;

    #[test]
    fn test_bank_start_lba_standard() {
        let b0 = bank_start_lba(0, 8);
        assert_eq!(b0, NHCD_BANKTABLE_ADDRESS_LBA + NHCD_BANKTABLE_SIZE_LBA);
        assert_eq!(bank_start_lba(1, 8), b0 + NHCD_BANK_SIZE_LBA);
        assert_eq!(bank_start_lba(7, 8), b0 + 7 * NHCD_BANK_SIZE_LBA);
    }

    #[test]
    fn test_bank_start_lba_extended() {
        // Bank 1 sits below the table and is capped accordingly.
        assert_eq!(bank_start_lba(0, 16), NHCD_EXTBANKTABLE_BANK_1_START_LBA);
        assert_eq!(
            bank_start_lba(0, 16) + bank_max_len_lba(0, 16),
            NHCD_BANKTABLE_ADDRESS_LBA
        );
        assert_eq!(bank_start_lba(1, 16), bank_start_lba(0, 8));
    }

    #[test]
    fn test_timestamp_round_trip() {
        let mut entry = NhcdBankEntry::new_zeroed();
        assert_eq!(entry.timestamp_unix(), -1);
        entry.set_timestamp_unix(1515795600); // 2018-01-12 22:20:00 UTC
        assert_eq!(&entry.timestamp, b"20180112222000");
        assert_eq!(entry.timestamp_unix(), 1515795600);
        entry.set_timestamp_unix(-1);
        assert_eq!(entry.timestamp_unix(), -1);
    }
}
