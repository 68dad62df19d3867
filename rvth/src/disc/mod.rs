//! GameCube/Wii disc format types.

use std::{ffi::CStr, mem::size_of, str::from_utf8};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{common::MagicBytes, util::static_assert};

pub mod ptbl;
pub mod wii;

/// Size in bytes of a disc sector. (32 KiB)
pub const SECTOR_SIZE: usize = 0x8000;

/// Size in bytes of a Wii partition sector group. (32 KiB * 64, 2 MiB)
pub const SECTOR_GROUP_SIZE: usize = SECTOR_SIZE * 64;

/// Size in bytes of the hashes block in a Wii disc sector
pub const HASHES_SIZE: usize = 0x400;

/// Size in bytes of the data block in a Wii disc sector (excluding hashes)
pub const SECTOR_DATA_SIZE: usize = SECTOR_SIZE - HASHES_SIZE; // 0x7C00

/// Magic bytes for Wii discs. Located at offset 0x18.
pub const WII_MAGIC: MagicBytes = [0x5D, 0x1C, 0x9E, 0xA3];

/// Magic bytes for GameCube discs. Located at offset 0x1C.
pub const GCN_MAGIC: MagicBytes = [0xC2, 0x33, 0x9F, 0x3D];

/// Byte offset of the region code within the GameCube bi2 block.
pub const GCN_REGION_OFFSET: u64 = 0x458;

/// Byte offset of the Wii region setting. (region.bin)
pub const WII_REGION_OFFSET: u64 = 0x4E000;

/// The size of a single-layer MiniDVD. (1.4 GB)
///
/// GameCube games use this format.
pub const MINI_DVD_SIZE: u64 = 1_459_978_240;

/// Shared GameCube & Wii disc header.
///
/// Always at the start of the disc image, and within each Wii partition.
/// Only the first LBA (512 bytes) is cached per bank; the remaining fields
/// of the full 0x400-byte header are padding there.
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct DiscHeader {
    /// Game ID (e.g. GM8E01 for Metroid Prime)
    pub game_id: [u8; 6],
    /// Used in multi-disc games
    pub disc_num: u8,
    /// Disc version
    pub disc_version: u8,
    /// Audio streaming enabled
    pub audio_streaming: u8,
    /// Audio streaming buffer size
    pub audio_stream_buf_size: u8,
    _pad1: [u8; 14],
    /// If this is a Wii disc, this will be 0x5D1C9EA3
    pub wii_magic: MagicBytes,
    /// If this is a GameCube disc, this will be 0xC2339F3D
    pub gcn_magic: MagicBytes,
    /// Game title
    pub game_title: [u8; 64],
    /// If 1, disc omits partition hashes
    pub no_partition_hashes: u8,
    /// If 1, disc omits partition encryption
    pub no_partition_encryption: u8,
    _pad2: [u8; 414],
}

static_assert!(size_of::<DiscHeader>() == 512);

impl DiscHeader {
    /// Game ID as a string.
    #[inline]
    pub fn game_id_str(&self) -> &str { from_utf8(&self.game_id).unwrap_or("[invalid]") }

    /// Game title as a string.
    #[inline]
    pub fn game_title_str(&self) -> &str {
        CStr::from_bytes_until_nul(&self.game_title)
            .ok()
            .and_then(|c| c.to_str().ok())
            .unwrap_or("[invalid]")
    }

    /// Whether this is a GameCube disc.
    #[inline]
    pub fn is_gamecube(&self) -> bool { self.gcn_magic == GCN_MAGIC }

    /// Whether this is a Wii disc.
    #[inline]
    pub fn is_wii(&self) -> bool { self.wii_magic == WII_MAGIC }

    /// Whether the disc has partition data hashes.
    #[inline]
    pub fn has_partition_hashes(&self) -> bool { self.no_partition_hashes == 0 }

    /// Whether the disc has partition data encryption.
    #[inline]
    pub fn has_partition_encryption(&self) -> bool { self.no_partition_encryption == 0 }
}
