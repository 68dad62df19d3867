//! Hash tree construction for encrypted Wii sector groups.
//!
//! Each 32 KiB sector carries a 0x400-byte hash block ahead of its data:
//! 31 H0 hashes (one per 1 KiB data chunk), the 8 H1 hashes of its
//! subgroup, and the 8 H2 hashes of the group. The per-group H3 hash
//! goes into the partition's H3 table. The unencrypted→encrypted
//! conversion builds these blocks from scratch for every group it emits.

use tracing::instrument;

use crate::{
    common::HashBytes,
    disc::{HASHES_SIZE, SECTOR_GROUP_SIZE, SECTOR_SIZE},
    util::{array_ref, digest::sha1_hash},
};

/// Sectors per hash group.
pub(crate) const SECTORS_PER_GROUP: usize = SECTOR_GROUP_SIZE / SECTOR_SIZE;

/// Data chunks covered by H0 per sector.
const H0_COUNT: usize = 31;
/// H0 table region within a sector's hash block.
const H0_OFF: usize = 0x000;
const H0_SIZE: usize = H0_COUNT * 20; // 0x26C
/// H1 table region: hashes of the subgroup's 8 H0 tables.
const H1_OFF: usize = 0x280;
const H1_SIZE: usize = 8 * 20; // 0xA0
/// H2 table region: hashes of the group's 8 H1 tables.
const H2_OFF: usize = 0x340;
const H2_SIZE: usize = 8 * 20; // 0xA0

/// Builds the H0/H1/H2 hash blocks of a decrypted sector group in place
/// and returns the group's H3 hash.
///
/// Expects each sector's hash block to be zeroed and its data area
/// populated. The data IV region (0x3D0) overlaps the written H2 table,
/// matching the on-disc layout.
#[instrument(skip_all)]
pub(crate) fn build_group_hashes(group: &mut [u8; SECTOR_GROUP_SIZE]) -> HashBytes {
    // H0: one hash per 1 KiB chunk of sector data, at the head of that
    // sector's hash block.
    for sector in 0..SECTORS_PER_GROUP {
        let base = sector * SECTOR_SIZE;
        let mut h0 = [0u8; H0_SIZE];
        for chunk in 0..H0_COUNT {
            let hash = sha1_hash(array_ref![
                group,
                base + HASHES_SIZE + chunk * HASHES_SIZE,
                HASHES_SIZE
            ]);
            h0[chunk * 20..chunk * 20 + 20].copy_from_slice(&hash);
        }
        group[base + H0_OFF..base + H0_OFF + H0_SIZE].copy_from_slice(&h0);
    }

    // H1: each subgroup of 8 sectors shares a table of its H0 hashes.
    for subgroup in 0..8 {
        let mut h1 = [0u8; H1_SIZE];
        for i in 0..8 {
            let base = (subgroup * 8 + i) * SECTOR_SIZE;
            let hash = sha1_hash(array_ref![group, base + H0_OFF, H0_SIZE]);
            h1[i * 20..i * 20 + 20].copy_from_slice(&hash);
        }
        for i in 0..8 {
            let base = (subgroup * 8 + i) * SECTOR_SIZE;
            group[base + H1_OFF..base + H1_OFF + H1_SIZE].copy_from_slice(&h1);
        }
    }

    // H2: the whole group shares a table of its 8 subgroup H1 hashes.
    let mut h2 = [0u8; H2_SIZE];
    for subgroup in 0..8 {
        let base = subgroup * 8 * SECTOR_SIZE;
        let hash = sha1_hash(array_ref![group, base + H1_OFF, H1_SIZE]);
        h2[subgroup * 20..subgroup * 20 + 20].copy_from_slice(&hash);
    }
    for sector in 0..SECTORS_PER_GROUP {
        let base = sector * SECTOR_SIZE;
        group[base + H2_OFF..base + H2_OFF + H2_SIZE].copy_from_slice(&h2);
    }

    sha1_hash(&h2)
}
