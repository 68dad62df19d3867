//! E2E tests for the copy engine: opening HDD images, extracting banks to
//! standalone images, and importing standalone images into banks.

mod common;

use common::*;
use rvth::{
    common::LBA_SIZE,
    nhcd::{bank_start_lba, NHCD_BANK_TYPE_WII_SL, NHCD_BANK_WII_SL_SIZE_RVTR_LBA},
    BankType, CryptoType, Error, ExtractOptions, RvtH, SigStatus,
};

fn hdd_with_wii_bank0(dir: &tempfile::TempDir) -> (std::path::PathBuf, Vec<u8>) {
    let path = dir.path().join("rvth.img");
    let image = build_wii_image(&WiiImageSpec::default());
    build_hdd(
        &path,
        8,
        &[HddBank { slot: 0, raw_type: NHCD_BANK_TYPE_WII_SL, image: &image }],
    );
    (path, image)
}

#[test]
fn open_hdd_reads_bank_table() {
    let dir = tempfile::tempdir().unwrap();
    let (path, image) = hdd_with_wii_bank0(&dir);

    let rvth = RvtH::open(&path).unwrap();
    assert!(rvth.is_hdd());
    assert_eq!(rvth.bank_count(), 8);

    let bank0 = rvth.bank(0).unwrap();
    assert_eq!(bank0.bank_type, BankType::WiiSingleLayer);
    assert!(!bank0.is_deleted);
    assert_eq!(bank0.lba_start, bank_start_lba(0, 8));
    assert_eq!(bank0.lba_len as usize, image.len() / LBA_SIZE);
    assert_eq!(bank0.game_id_str(), "RVTE01");
    assert_eq!(bank0.region_code, 2);
    assert_eq!(bank0.crypto_type, CryptoType::Debug);
    assert_eq!(bank0.ios_version, 21);
    assert_eq!(bank0.ticket.sig_status, SigStatus::Ok);
    assert_eq!(bank0.tmd.sig_status, SigStatus::Ok);
    assert_eq!(bank0.timestamp, 1704110400); // 2024-01-01 12:00:00 UTC

    let bank1 = rvth.bank(1).unwrap();
    assert_eq!(bank1.bank_type, BankType::Empty);
    assert!(!bank1.is_deleted);
}

#[test]
fn extract_is_bit_faithful_and_sparse() {
    let dir = tempfile::tempdir().unwrap();
    let (path, image) = hdd_with_wii_bank0(&dir);
    let out = dir.path().join("out.gcm");

    let rvth = RvtH::open(&path).unwrap();
    rvth.extract(0, &out, None, &ExtractOptions::default(), None).unwrap();

    let meta = std::fs::metadata(&out).unwrap();
    assert_eq!(meta.len(), image.len() as u64);
    let extracted = std::fs::read(&out).unwrap();
    assert_eq!(extracted, image);
}

#[test]
fn extract_restores_flushed_disc_header() {
    let dir = tempfile::tempdir().unwrap();
    let (path, image) = hdd_with_wii_bank0(&dir);
    let out = dir.path().join("out.gcm");

    // Open first so the disc header is cached, then zero the header on
    // "disk", as the RVT-H Flush function does.
    let rvth = RvtH::open(&path).unwrap();
    let bank_base = bank_start_lba(0, 8) as u64 * LBA_SIZE as u64;
    write_range(&path, bank_base, &[0u8; LBA_SIZE]);

    rvth.extract(0, &out, None, &ExtractOptions::default(), None).unwrap();
    let extracted = std::fs::read(&out).unwrap();
    assert_eq!(&extracted[..LBA_SIZE], &image[..LBA_SIZE]);
}

#[test]
fn extract_with_sdk_header() {
    let dir = tempfile::tempdir().unwrap();
    let (path, image) = hdd_with_wii_bank0(&dir);
    let out = dir.path().join("out.gcm");

    let rvth = RvtH::open(&path).unwrap();
    let options = ExtractOptions { prepend_sdk_header: true };
    rvth.extract(0, &out, None, &options, None).unwrap();

    let extracted = std::fs::read(&out).unwrap();
    assert_eq!(extracted.len(), image.len() + 32768);
    // NDEV recognition bytes.
    assert_eq!(&extracted[0x0000..0x0004], &[0xFF, 0xFF, 0x00, 0x00]);
    assert_eq!(&extracted[0x082C..0x0830], &[0x00, 0x00, 0xE0, 0x06]);
    assert_eq!(&extracted[0x0844..0x0848], &[0x01, 0x00, 0x00, 0x00]);
    // The disc image follows the 32 KiB preamble.
    assert_eq!(&extracted[32768..32768 + LBA_SIZE], &image[..LBA_SIZE]);
    assert_eq!(&extracted[32768..], &image[..]);

    // SDK-prefixed images are recognized when reopened.
    let reopened = RvtH::open(&out).unwrap();
    assert_eq!(reopened.bank(0).unwrap().bank_type, BankType::WiiSingleLayer);
    assert_eq!(reopened.bank(0).unwrap().game_id_str(), "RVTE01");
}

#[test]
fn extract_gcn_standalone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gcn.gcm");
    let image = build_gcn_image(0x1200);
    std::fs::write(&path, &image).unwrap();
    let out = dir.path().join("out.gcm");

    let rvth = RvtH::open(&path).unwrap();
    let bank = rvth.bank(0).unwrap();
    assert!(!rvth.is_hdd());
    assert_eq!(bank.bank_type, BankType::Gcn);
    assert_eq!(bank.crypto_type, CryptoType::None);
    assert_eq!(bank.region_code, 1);

    rvth.extract(0, &out, None, &ExtractOptions::default(), None).unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), image);
}

#[test]
fn sdk_header_is_rejected_for_gcn() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gcn.gcm");
    std::fs::write(&path, build_gcn_image(0x1000)).unwrap();
    let out = dir.path().join("out.gcm");

    let rvth = RvtH::open(&path).unwrap();
    assert_eq!(rvth.bank(0).unwrap().bank_type, BankType::Gcn);
    let options = ExtractOptions { prepend_sdk_header: true };
    match rvth.extract(0, &out, None, &options, None) {
        Err(Error::Bank(rvth::BankError::NdevGcnNotSupported)) => {}
        other => panic!("expected NdevGcnNotSupported, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn import_round_trips_bank_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let (path, image) = hdd_with_wii_bank0(&dir);
    let out = dir.path().join("out.gcm");

    let rvth = RvtH::open(&path).unwrap();
    rvth.extract(0, &out, None, &ExtractOptions::default(), None).unwrap();
    drop(rvth);

    let mut rvth = RvtH::open(&path).unwrap();
    rvth.import(1, &out, None).unwrap();
    drop(rvth);

    // Reopen and compare the two banks.
    let rvth = RvtH::open(&path).unwrap();
    let bank0 = rvth.bank(0).unwrap();
    let bank1 = rvth.bank(1).unwrap();
    assert_eq!(bank1.bank_type, bank0.bank_type);
    assert!(!bank1.is_deleted);
    assert_eq!(bank1.lba_len, bank0.lba_len);
    assert_eq!(bank1.lba_start, bank_start_lba(1, 8));
    assert_eq!(bank1.region_code, bank0.region_code);
    assert_eq!(bank1.ios_version, bank0.ios_version);
    assert_eq!(bank1.crypto_type, CryptoType::Debug);
    assert_eq!(bank1.disc_header, bank0.disc_header);

    // Ticket and TMD bytes are identical: a valid debug image is imported
    // without recryption.
    let game_off = GAME_PART_LBA as u64 * LBA_SIZE as u64;
    let bank1_base = bank_start_lba(1, 8) as u64 * LBA_SIZE as u64;
    let part_header = read_range(&path, bank1_base + game_off, 0x8000);
    assert_eq!(part_header, &image[game_off as usize..game_off as usize + 0x8000]);

    // The imported-image marker was stamped into the header area.
    let marker = read_range(&path, bank1_base + 0x200, 25);
    assert_eq!(&marker, b"RVT-H imported disc image");
}

#[test]
fn import_requires_empty_or_deleted_bank() {
    let dir = tempfile::tempdir().unwrap();
    let (path, _image) = hdd_with_wii_bank0(&dir);
    let out = dir.path().join("out.gcm");

    let rvth = RvtH::open(&path).unwrap();
    rvth.extract(0, &out, None, &ExtractOptions::default(), None).unwrap();
    drop(rvth);

    let mut rvth = RvtH::open(&path).unwrap();
    match rvth.import(0, &out, None) {
        Err(Error::Bank(rvth::BankError::BankNotEmptyOrDeleted)) => {}
        other => panic!("expected BankNotEmptyOrDeleted, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn import_dual_layer_placement_rules() {
    let dir = tempfile::tempdir().unwrap();
    let image = build_wii_image(&WiiImageSpec::default());

    // A sparse dual-layer standalone image: longer than the single-layer
    // threshold, nothing but the header area materialized.
    let dl_path = dir.path().join("dl.gcm");
    {
        std::fs::write(&dl_path, &image).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&dl_path).unwrap();
        file.set_len((NHCD_BANK_WII_SL_SIZE_RVTR_LBA as u64 + 4096) * LBA_SIZE as u64).unwrap();
    }
    let src = RvtH::open(&dl_path).unwrap();
    assert_eq!(src.bank(0).unwrap().bank_type, BankType::WiiDualLayer);
    drop(src);

    // The last bank cannot start a dual-layer image.
    let path = dir.path().join("rvth.img");
    build_hdd(&path, 8, &[HddBank { slot: 0, raw_type: NHCD_BANK_TYPE_WII_SL, image: &image }]);
    let mut rvth = RvtH::open(&path).unwrap();
    match rvth.import(7, &dl_path, None) {
        Err(Error::Bank(rvth::BankError::ImportDlLastBank)) => {}
        other => panic!("expected ImportDlLastBank, got {:?}", other.map(|_| ())),
    }
    drop(rvth);

    // With bank 2 occupied, a dual-layer image cannot start in bank 1.
    let path2 = dir.path().join("rvth2.img");
    build_hdd(&path2, 8, &[HddBank { slot: 1, raw_type: NHCD_BANK_TYPE_WII_SL, image: &image }]);
    let mut rvth = RvtH::open(&path2).unwrap();
    match rvth.import(0, &dl_path, None) {
        Err(Error::Bank(rvth::BankError::Bank2DlNotEmptyOrDeleted)) => {}
        other => panic!("expected Bank2DlNotEmptyOrDeleted, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn progress_callback_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let (path, _image) = hdd_with_wii_bank0(&dir);
    let out = dir.path().join("out.gcm");

    let rvth = RvtH::open(&path).unwrap();
    let mut calls = 0u32;
    let mut cb = |_state: &rvth::ProgressState| {
        calls += 1;
        false
    };
    match rvth.extract(0, &out, None, &ExtractOptions::default(), Some(&mut cb)) {
        Err(Error::Canceled) => {}
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }
    assert_eq!(calls, 1);
    // Nothing was copied.
    let extracted = std::fs::read(&out).unwrap();
    assert!(extracted.iter().all(|&b| b == 0));
}

#[test]
fn delete_and_undelete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (path, _image) = hdd_with_wii_bank0(&dir);

    let mut rvth = RvtH::open(&path).unwrap();
    rvth.delete_bank(0).unwrap();
    assert!(rvth.bank(0).unwrap().is_deleted);
    match rvth.delete_bank(0) {
        Err(Error::Bank(rvth::BankError::BankIsDeleted)) => {}
        other => panic!("expected BankIsDeleted, got {:?}", other.map(|_| ())),
    }
    drop(rvth);

    // The image data survives deletion; reopening identifies the deleted
    // image from its disc header.
    let mut rvth = RvtH::open(&path).unwrap();
    let bank0 = rvth.bank(0).unwrap();
    assert!(bank0.is_deleted);
    assert_eq!(bank0.bank_type, BankType::WiiSingleLayer);
    assert_eq!(bank0.game_id_str(), "RVTE01");

    rvth.undelete_bank(0).unwrap();
    drop(rvth);

    let rvth = RvtH::open(&path).unwrap();
    let bank0 = rvth.bank(0).unwrap();
    assert!(!bank0.is_deleted);
    assert_eq!(bank0.bank_type, BankType::WiiSingleLayer);
    match RvtH::open(&path).unwrap().bank(1) {
        Ok(entry) => assert_eq!(entry.bank_type, BankType::Empty),
        Err(e) => panic!("bank 1 lookup failed: {e}"),
    }
}

#[test]
fn reader_bounds_prevent_partial_io() {
    // A window read crossing the end fails outright rather than returning
    // a short buffer.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.gcm");
    std::fs::write(&path, build_gcn_image(0x100)).unwrap();

    let file = rvth::io::RefFile::open(&path).unwrap();
    let reader = rvth::io::Reader::open(file, 0, 0).unwrap();
    assert_eq!(reader.lba_len(), 0x100);
    let mut buf = vec![0u8; 2 * LBA_SIZE];
    assert!(reader.read(&mut buf, 0xFF, 2).is_err());
    assert!(reader.read(&mut buf, 0xFE, 2).is_ok());
}
