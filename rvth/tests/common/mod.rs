//! Shared fixtures: synthetic Wii disc images and RVT-H HDD images.
#![allow(dead_code)]

use std::{fs::OpenOptions, io::{Seek, SeekFrom, Write}, mem::size_of, path::Path};

use rvth::{
    cert::Issuer,
    common::LBA_SIZE,
    disc::{
        wii::{ContentMetadata, Ticket, TmdHeader, WiiPartitionHeader, SIG_TYPE_RSA2048},
        DiscHeader, GCN_MAGIC, WII_MAGIC,
    },
    nhcd::{bank_start_lba, NHCD_BANKTABLE_ADDRESS_LBA},
    CryptoType,
};
use zerocopy::{FromZeros, IntoBytes};

/// Known-plaintext title key used by every fixture ticket.
pub const TITLE_KEY: [u8; 16] = [0x11; 16];

/// LBA of the game partition within fixture images.
pub const GAME_PART_LBA: u32 = 0x400;

/// Byte offset of the TMD within the fixture partition header.
pub const TMD_OFF: u64 = 0x2C0;

#[derive(Clone, Copy)]
pub struct WiiImageSpec {
    /// Total image length in LBAs.
    pub total_lba: u32,
    /// Whether the partition data is stored encrypted (retail-style
    /// layout) or as raw 31 KiB devkit clusters.
    pub encrypted: bool,
    /// Sign the ticket/TMD with the retail issuers instead of debug.
    pub retail: bool,
}

impl Default for WiiImageSpec {
    fn default() -> Self { Self { total_lba: 0x1000, encrypted: true, retail: false } }
}

/// Builds a synthetic Wii disc image in memory.
///
/// Layout: disc header at 0, partition table at 0x40000, region setting at
/// 0x4E000, game partition at `GAME_PART_LBA` with ticket + TMD in the
/// first 0x8000 bytes and a deterministic data pattern after it.
pub fn build_wii_image(spec: &WiiImageSpec) -> Vec<u8> {
    let mut image = vec![0u8; spec.total_lba as usize * LBA_SIZE];

    // Disc header.
    let mut header = DiscHeader::new_zeroed();
    header.game_id = *b"RVTE01";
    header.disc_version = 1;
    header.wii_magic = WII_MAGIC;
    header.game_title[..9].copy_from_slice(b"Test Disc");
    if !spec.encrypted {
        header.no_partition_hashes = 1;
        header.no_partition_encryption = 1;
    }
    image[..LBA_SIZE].copy_from_slice(header.as_bytes());

    // Partition table: one data partition in group 0.
    let game_off = GAME_PART_LBA as usize * LBA_SIZE;
    image[0x40000..0x40004].copy_from_slice(&1u32.to_be_bytes());
    image[0x40004..0x40008].copy_from_slice(&(0x40020u32 >> 2).to_be_bytes());
    image[0x40020..0x40024].copy_from_slice(&((game_off as u32) >> 2).to_be_bytes());
    // kind 0 (data) is already zero

    // Region setting.
    image[0x4E000..0x4E004].copy_from_slice(&2u32.to_be_bytes());

    // Partition header: ticket + layout fields.
    let mut part_header = WiiPartitionHeader::new_zeroed();
    part_header.ticket = build_ticket(spec.retail);
    let tmd = build_tmd(spec.retail);
    part_header.tmd_size.set(tmd.len() as u32);
    part_header.tmd_off.set((TMD_OFF >> 2) as u32);
    part_header.h3_table_off.set(0x8000 >> 2);
    if spec.encrypted {
        part_header.data_off.set(0x20000 >> 2);
        part_header.data_size.set(0x40000 >> 2);
    }
    image[game_off..game_off + size_of::<WiiPartitionHeader>()]
        .copy_from_slice(part_header.as_bytes());
    image[game_off + TMD_OFF as usize..game_off + TMD_OFF as usize + tmd.len()]
        .copy_from_slice(&tmd);

    // Partition data: deterministic pattern.
    let data_off = if spec.encrypted { game_off + 0x20000 } else { game_off + 0x8000 };
    for (i, b) in image[data_off..].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    image
}

fn build_ticket(retail: bool) -> Ticket {
    let mut ticket = Ticket::new_zeroed();
    ticket.header.sig_type.set(SIG_TYPE_RSA2048);
    ticket.header.sig[..4].copy_from_slice(&[0x5A, 0x5A, 0x5A, 0x5A]);
    let issuer = if retail { Issuer::PpkiTicket } else { Issuer::DpkiTicket };
    issuer.write_to(&mut ticket.sig_issuer);
    ticket.title_id = *b"\x00\x01\x00\x00RVTE";
    ticket.ticket_title_version.set(33);
    let crypto = if retail { CryptoType::Retail } else { CryptoType::Debug };
    ticket.set_title_key(&TITLE_KEY, crypto).unwrap();
    ticket
}

fn build_tmd(retail: bool) -> Vec<u8> {
    let mut tmd = TmdHeader::new_zeroed();
    tmd.header.sig_type.set(SIG_TYPE_RSA2048);
    tmd.header.sig[..4].copy_from_slice(&[0xA5, 0xA5, 0xA5, 0xA5]);
    let issuer = if retail { Issuer::PpkiTmd } else { Issuer::DpkiTmd };
    issuer.write_to(&mut tmd.sig_issuer);
    tmd.ios_id = [0, 0, 0, 1, 0, 0, 0, 21];
    tmd.title_id = *b"\x00\x01\x00\x00RVTE";
    tmd.title_version.set(33);
    tmd.num_contents.set(1);

    let mut content = ContentMetadata::new_zeroed();
    content.content_index.set(0);
    content.size.set(0x40000);

    let mut buf = tmd.as_bytes().to_vec();
    buf.extend_from_slice(content.as_bytes());
    buf
}

/// Builds a GameCube disc image: header plus a deterministic pattern.
pub fn build_gcn_image(total_lba: u32) -> Vec<u8> {
    let mut image = vec![0u8; total_lba as usize * LBA_SIZE];
    let mut header = DiscHeader::new_zeroed();
    header.game_id = *b"GVTE01";
    header.disc_version = 1;
    header.gcn_magic = GCN_MAGIC;
    image[..LBA_SIZE].copy_from_slice(header.as_bytes());
    // bi2 region code
    image[0x458..0x45C].copy_from_slice(&1u32.to_be_bytes());
    for (i, b) in image[0x10000..0x80000].iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }
    image
}

/// File length used for HDD fixtures; larger than two banks so the open
/// heuristic takes the HDD path, sparse on any reasonable filesystem.
pub const HDD_FILE_LEN: u64 = 10_000_000_000;

/// A bank to place into an HDD fixture.
pub struct HddBank<'a> {
    pub slot: u32,
    pub raw_type: u32,
    pub image: &'a [u8],
}

/// Builds an RVT-H HDD image file with the given banks occupied.
pub fn build_hdd(path: &Path, bank_count: u32, banks: &[HddBank<'_>]) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap();
    file.set_len(HDD_FILE_LEN).unwrap();

    let table_base = NHCD_BANKTABLE_ADDRESS_LBA as u64 * LBA_SIZE as u64;
    let mut header = [0u8; 512];
    header[..4].copy_from_slice(b"NHCD");
    header[4..8].copy_from_slice(&bank_count.to_be_bytes());
    file.seek(SeekFrom::Start(table_base)).unwrap();
    file.write_all(&header).unwrap();

    for bank in banks {
        let lba_start = bank_start_lba(bank.slot, bank_count);
        let lba_len = (bank.image.len() / LBA_SIZE) as u32;

        let mut entry = [0u8; 512];
        entry[..4].copy_from_slice(&bank.raw_type.to_be_bytes());
        entry[8..12].copy_from_slice(&lba_start.to_be_bytes());
        entry[12..16].copy_from_slice(&lba_len.to_be_bytes());
        entry[16..30].copy_from_slice(b"20240101120000");
        file.seek(SeekFrom::Start(table_base + (1 + bank.slot as u64) * 512)).unwrap();
        file.write_all(&entry).unwrap();

        file.seek(SeekFrom::Start(lba_start as u64 * LBA_SIZE as u64)).unwrap();
        file.write_all(bank.image).unwrap();
    }
    file.flush().unwrap();
}

/// Reads a byte range of a file.
pub fn read_range(path: &Path, offset: u64, len: usize) -> Vec<u8> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).unwrap();
    buf
}

/// Overwrites a byte range of a file in place.
pub fn write_range(path: &Path, offset: u64, data: &[u8]) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
}

/// Decrypts a 32 KiB Wii sector: hash block with a zero IV, data with the
/// IV stored at 0x3D0 of the encrypted hash block.
pub fn decrypt_wii_sector(sector: &mut [u8], key: &[u8; 16]) {
    use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
    assert_eq!(sector.len(), 0x8000);
    let iv: [u8; 16] = sector[0x3D0..0x3E0].try_into().unwrap();
    let zero_iv = [0u8; 16];
    <cbc::Decryptor<aes::Aes128>>::new(key.into(), (&zero_iv).into())
        .decrypt_padded_mut::<NoPadding>(&mut sector[..0x400])
        .unwrap();
    <cbc::Decryptor<aes::Aes128>>::new(key.into(), (&iv).into())
        .decrypt_padded_mut::<NoPadding>(&mut sector[0x400..])
        .unwrap();
}
