//! Wii partition table parsing.

use std::mem::size_of;

use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    common::{bytes_to_lba, PartitionKind},
    disc::wii::WII_PART_GROUP_OFF,
    io::Reader,
    util::static_assert,
    BankError, Error, Result,
};

/// Maximum number of partitions across all four groups. Anything larger is
/// treated as a corrupted table.
pub const MAX_PARTITIONS: usize = 96;

#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub(crate) struct WiiPartGroup {
    pub(crate) part_count: U32,
    pub(crate) part_entry_off: U32,
}

static_assert!(size_of::<WiiPartGroup>() == 8);

impl WiiPartGroup {
    pub(crate) fn part_entry_off(&self) -> u64 { (self.part_entry_off.get() as u64) << 2 }
}

#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub(crate) struct WiiPartEntry {
    pub(crate) offset: U32,
    pub(crate) kind: U32,
}

static_assert!(size_of::<WiiPartEntry>() == 8);

impl WiiPartEntry {
    pub(crate) fn offset(&self) -> u64 { (self.offset.get() as u64) << 2 }
}

/// A parsed Wii partition table entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionEntry {
    /// Starting LBA of the partition, relative to the bank.
    pub lba_start: u32,
    /// Length of the partition in LBAs, up to the next partition (or the
    /// end of the bank for the last one).
    pub lba_len: u32,
    /// The kind of partition.
    pub kind: PartitionKind,
}

/// Parses the partition table of a Wii bank.
///
/// `lba_len` bounds the table: entries at or beyond it are corruption.
pub fn parse(reader: &Reader, lba_len: u32) -> Result<Vec<PartitionEntry>> {
    let buf = reader.read_bytes(WII_PART_GROUP_OFF, 32)?;
    let groups = <[WiiPartGroup; 4]>::read_from_bytes(buf.as_slice())
        .map_err(|_| Error::Bank(BankError::PartitionTableCorrupted))?;

    let total = groups.iter().map(|g| g.part_count.get() as usize).sum::<usize>();
    if total == 0 || total > MAX_PARTITIONS {
        return Err(Error::Bank(BankError::PartitionTableCorrupted));
    }

    let mut entries = Vec::with_capacity(total);
    for group in &groups {
        let count = group.part_count.get() as usize;
        if count == 0 {
            continue;
        }
        let entry_off = group.part_entry_off();
        if bytes_to_lba(entry_off) >= lba_len {
            return Err(Error::Bank(BankError::PartitionTableCorrupted));
        }
        let buf = reader.read_bytes(entry_off, count * size_of::<WiiPartEntry>())?;
        for chunk in buf.chunks_exact(size_of::<WiiPartEntry>()) {
            let entry = WiiPartEntry::read_from_bytes(chunk)
                .map_err(|_| Error::Bank(BankError::PartitionTableCorrupted))?;
            let lba_start = bytes_to_lba(entry.offset());
            if lba_start == 0 || lba_start >= lba_len {
                return Err(Error::Bank(BankError::PartitionTableCorrupted));
            }
            entries.push(PartitionEntry {
                lba_start,
                lba_len: 0,
                kind: PartitionKind::from(entry.kind.get()),
            });
        }
    }

    // Partition lengths run to the next partition's start, or the end of
    // the bank for the last one.
    entries.sort_by_key(|e| e.lba_start);
    for i in 0..entries.len() {
        let end = if i + 1 < entries.len() { entries[i + 1].lba_start } else { lba_len };
        entries[i].lba_len = end.saturating_sub(entries[i].lba_start);
    }
    Ok(entries)
}

/// Finds the game (data) partition.
pub fn find_game(entries: &[PartitionEntry]) -> Option<&PartitionEntry> {
    entries.iter().find(|e| e.kind == PartitionKind::Data)
}
