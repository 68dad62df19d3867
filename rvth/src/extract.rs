//! Copy engine: extracting banks to standalone images and importing
//! standalone images into banks.

use std::path::Path;

use chrono::Utc;
use tracing::debug;
use zerocopy::IntoBytes;

use crate::{
    common::{
        bytes_to_lba, lba_to_bytes, reborrow_progress, BankType, CryptoType, ProgressCallback,
        ProgressOp, ProgressState, LBA_SIZE,
    },
    disc::ptbl,
    io::Reader,
    nhcd::{NHCD_BANK_SIZE_LBA, NHCD_EXTBANKTABLE_BANK_1_SIZE_LBA},
    recrypt,
    rvth::{bank_out_of_range, RvtH},
    util::Align,
    BankError, Error, Result, ResultContext,
};

/// Size of the NDEV SDK preamble in bytes. (32 KiB)
pub const SDK_HEADER_SIZE_BYTES: usize = 32768;

/// Size of the NDEV SDK preamble in LBAs.
pub const SDK_HEADER_SIZE_LBA: u32 = (SDK_HEADER_SIZE_BYTES / LBA_SIZE) as u32;

/// Copy buffer size. (1 MiB)
const BUF_SIZE: usize = 1048576;

/// Copy buffer size in LBAs.
const LBA_COUNT_BUF: u32 = (BUF_SIZE / LBA_SIZE) as u32;

/// Options for [`RvtH::extract`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractOptions {
    /// Prepend the 32 KiB NDEV SDK preamble so the image is recognized by
    /// the NDEV debugging hardware. Unsupported for GameCube banks.
    pub prepend_sdk_header: bool,
}

/// Whether a byte window contains only zeroes. Sparse writing skips such
/// blocks entirely.
#[inline]
pub(crate) fn is_block_empty(buf: &[u8]) -> bool { buf.iter().all(|&b| b == 0) }

/// Builds the fixed NDEV SDK preamble for Wii images.
fn build_sdk_header() -> Vec<u8> {
    let mut header = vec![0u8; SDK_HEADER_SIZE_BYTES];
    // 0x0000: FF FF 00 00
    header[0x0000] = 0xFF;
    header[0x0001] = 0xFF;
    // 0x082C: 00 00 E0 06
    header[0x082E] = 0xE0;
    header[0x082F] = 0x06;
    // 0x0844: 01 00 00 00
    header[0x0844] = 0x01;
    header
}

pub(crate) fn report(
    progress: &mut Option<ProgressCallback<'_>>,
    state: &ProgressState,
) -> Result<()> {
    if let Some(cb) = progress {
        if !cb(state) {
            return Err(Error::Canceled);
        }
    }
    Ok(())
}

pub(crate) fn unix_now() -> i64 { Utc::now().timestamp() }

impl RvtH {
    /// Extracts a bank to a standalone disc image at `path`.
    ///
    /// `recrypt_key` optionally re-encrypts the output: extracting an
    /// unencrypted devkit bank with an encrypted target performs the
    /// 31K→32K conversion, and any other mismatched target runs the
    /// recryption pipeline on the written file.
    pub fn extract(
        &self,
        bank: u32,
        path: impl AsRef<Path>,
        recrypt_key: Option<CryptoType>,
        options: &ExtractOptions,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<()> {
        let entry = self.bank(bank)?;

        let unenc_to_enc = entry.bank_type.is_wii()
            && entry.crypto_type == CryptoType::None
            && matches!(
                recrypt_key,
                Some(CryptoType::Debug | CryptoType::Retail | CryptoType::Korean)
            );

        let mut gcm_lba_len = if unenc_to_enc {
            // Converting 31 KiB devkit clusters to full 32 KiB encrypted
            // clusters grows the game partition's data area.
            let game = entry
                .partitions()
                .and_then(ptbl::find_game)
                .ok_or(Error::Bank(BankError::NoGamePartition))?;
            let raw = game.lba_len - bytes_to_lba(0x8000);
            let mut data_out = raw / 3968 * 4096;
            if raw % 3968 != 0 {
                data_out += 4096;
            }
            data_out + bytes_to_lba(0x20000) + game.lba_start
        } else {
            entry.lba_len
        };

        if options.prepend_sdk_header {
            if entry.bank_type == BankType::Gcn {
                return Err(Error::Bank(BankError::NdevGcnNotSupported));
            }
            gcm_lba_len += SDK_HEADER_SIZE_LBA;
        }

        let mut dest = RvtH::create_gcm(path, gcm_lba_len)?;

        if options.prepend_sdk_header {
            let header = build_sdk_header();
            let reader = dest.entries[0].reader.as_mut().expect("created GCM without reader");
            reader.write(&header, 0, SDK_HEADER_SIZE_LBA)?;
            // Exclude the preamble from all further logical offsets.
            reader.lba_adjust(SDK_HEADER_SIZE_LBA)?;
            dest.entries[0].lba_len -= SDK_HEADER_SIZE_LBA;
        }

        if unenc_to_enc {
            recrypt::copy_to_gcm_encrypting(&mut dest, self, bank, reborrow_progress(&mut progress))?;
        } else {
            copy_to_gcm(&mut dest, self, bank, reborrow_progress(&mut progress))?;
        }

        if let Some(key) = recrypt_key {
            if matches!(key, CryptoType::Debug | CryptoType::Retail | CryptoType::Korean)
                && entry.bank_type.is_wii()
                && dest.entries[0].crypto_type != key
            {
                dest.recrypt_partitions(0, key, progress)?;
            }
        }
        Ok(())
    }

    /// Imports a standalone disc image into a bank.
    ///
    /// Wii images that are retail-encrypted or carry invalid signatures
    /// are automatically re-encrypted to the debug variant afterwards;
    /// otherwise the bank is stamped with the imported-image marker so the
    /// device firmware accepts it as devkit content.
    pub fn import(
        &mut self,
        bank: u32,
        path: impl AsRef<Path>,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<()> {
        let src = RvtH::open(path)?;
        if src.is_hdd() || src.bank_count() > 1 {
            return Err(Error::Bank(BankError::IsHddImage));
        }

        copy_to_hdd(self, bank, &src, 0, reborrow_progress(&mut progress))?;

        let entry = self.bank(bank)?;
        if entry.bank_type.is_wii()
            && (matches!(entry.crypto_type, CryptoType::Retail | CryptoType::Korean)
                || entry.ticket.sig_status != crate::common::SigStatus::Ok
                || entry.tmd.sig_status != crate::common::SigStatus::Ok)
        {
            // Retail or Korean encryption, or an invalid signature; the
            // RVT-H firmware only boots debug content.
            self.recrypt_partitions(bank, CryptoType::Debug, progress)
        } else {
            self.recrypt_id(bank)
        }
    }
}

/// Copies a bank to a writable standalone disc image with sparse-write
/// optimization.
pub(crate) fn copy_to_gcm(
    dest: &mut RvtH,
    src: &RvtH,
    bank_src: u32,
    mut progress: Option<ProgressCallback<'_>>,
) -> Result<()> {
    if dest.is_hdd() || dest.bank_count() != 1 {
        // Copying to HDDs is handled by copy_to_hdd.
        return Err(Error::Bank(BankError::IsHddImage));
    }
    let entry_src = src.bank(bank_src)?;
    match entry_src.bank_type {
        BankType::Gcn | BankType::WiiSingleLayer | BankType::WiiDualLayer => {}
        BankType::Empty => return Err(Error::Bank(BankError::BankEmpty)),
        BankType::WiiDualLayerBank2 => return Err(Error::Bank(BankError::BankDl2)),
        BankType::Unknown => return Err(Error::Bank(BankError::BankUnknown)),
    }
    let src_reader = entry_src.reader().expect("source bank without reader").clone();
    let dest_reader = dest.entries[0].reader.as_ref().expect("destination without reader").clone();

    // Let the filesystem know the full file size up front so skipped
    // blocks become holes.
    dest.file
        .make_sparse(lba_to_bytes(dest_reader.lba_start() + dest_reader.lba_len()))
        .context("Making destination sparse")?;

    // Copy the bank metadata.
    let entry_dest = &mut dest.entries[0];
    entry_dest.bank_type = entry_src.bank_type;
    entry_dest.region_code = entry_src.region_code;
    entry_dest.is_deleted = false;
    entry_dest.crypto_type = entry_src.crypto_type;
    entry_dest.sig_type = entry_src.sig_type;
    entry_dest.ios_version = entry_src.ios_version;
    entry_dest.ticket = entry_src.ticket;
    entry_dest.tmd = entry_src.tmd;
    entry_dest.disc_header = entry_src.disc_header.clone();
    entry_dest.timestamp =
        if entry_src.timestamp >= 0 { entry_src.timestamp } else { unix_now() };

    let lba_copy_len = entry_src.lba_len;
    let mut state = ProgressState {
        op: ProgressOp::Extract,
        bank_src,
        bank_dst: 0,
        lba_processed: 0,
        lba_total: lba_copy_len,
    };
    report(&mut progress, &state)?;

    let mut buf = vec![0u8; BUF_SIZE];
    let lba_buf_max = lba_copy_len.align_down(LBA_COUNT_BUF);
    let mut lba_nonsparse = 0;
    let mut lba_count = 0;
    while lba_count < lba_buf_max {
        if lba_count != 0 {
            state.lba_processed = lba_count;
            report(&mut progress, &state)?;
        }

        src_reader.read(&mut buf, lba_count, LBA_COUNT_BUF)?;

        if lba_count == 0 && !crate::bank::header_has_magic(buf[..LBA_SIZE].try_into().unwrap()) {
            // The RVT-H "Flush" function may have zeroed the disc header;
            // restore it from the cached copy.
            debug!("restoring zeroed disc header");
            buf[..LBA_SIZE].copy_from_slice(entry_src.disc_header.as_bytes());
        }

        // Skip empty 4 KiB blocks.
        for sprs in (0..BUF_SIZE).step_by(4096) {
            if !is_block_empty(&buf[sprs..sprs + 4096]) {
                lba_nonsparse = lba_count + (sprs / LBA_SIZE) as u32;
                dest_reader.write(&buf[sprs..sprs + 4096], lba_nonsparse, 8)?;
                lba_nonsparse += 7;
            }
        }
        lba_count += LBA_COUNT_BUF;
    }

    // Remaining tail, at single-LBA granularity.
    if lba_count < lba_copy_len {
        let lba_left = lba_copy_len - lba_count;
        let sz_left = lba_left as usize * LBA_SIZE;

        state.lba_processed = lba_count;
        report(&mut progress, &state)?;
        src_reader.read(&mut buf[..sz_left], lba_count, lba_left)?;

        if lba_count == 0 && !crate::bank::header_has_magic(buf[..LBA_SIZE].try_into().unwrap()) {
            debug!("restoring zeroed disc header");
            buf[..LBA_SIZE].copy_from_slice(entry_src.disc_header.as_bytes());
        }

        for sprs in (0..sz_left).step_by(LBA_SIZE) {
            if !is_block_empty(&buf[sprs..sprs + LBA_SIZE]) {
                lba_nonsparse = lba_count + (sprs / LBA_SIZE) as u32;
                dest_reader.write(&buf[sprs..sprs + LBA_SIZE], lba_nonsparse, 1)?;
            }
        }
    }

    state.lba_processed = lba_copy_len;
    report(&mut progress, &state)?;

    if lba_nonsparse != lba_copy_len - 1 {
        // The last LBA was sparse; write a real zero block so the file
        // length is exact.
        buf[..LBA_SIZE].fill(0);
        dest_reader.write(&buf[..LBA_SIZE], lba_copy_len - 1, 1)?;
    }

    dest_reader.flush()
}

/// Copies a standalone disc image (or bank) into an RVT-H bank and
/// updates the bank table.
pub(crate) fn copy_to_hdd(
    dest: &mut RvtH,
    bank_dest: u32,
    src: &RvtH,
    bank_src: u32,
    mut progress: Option<ProgressCallback<'_>>,
) -> Result<()> {
    if !dest.is_hdd() {
        return Err(Error::Bank(BankError::NotHddImage));
    }
    let entry_src = src.bank(bank_src)?;
    match entry_src.bank_type {
        BankType::Gcn | BankType::WiiSingleLayer | BankType::WiiDualLayer => {}
        BankType::Empty => return Err(Error::Bank(BankError::BankEmpty)),
        BankType::WiiDualLayerBank2 => return Err(Error::Bank(BankError::BankDl2)),
        BankType::Unknown => return Err(Error::Bank(BankError::BankUnknown)),
    }

    let bank_count_dest = dest.bank_count();
    if bank_dest >= bank_count_dest {
        return Err(bank_out_of_range());
    }

    if entry_src.bank_type == BankType::WiiDualLayer {
        // A dual-layer image spans this bank and the next.
        if bank_count_dest > 8 && bank_dest == 0 {
            // Extended bank table: bank 1 is shortened and cannot span.
            return Err(Error::Bank(BankError::ImportDlExtNoBank1));
        }
        if bank_dest == bank_count_dest - 1 {
            return Err(Error::Bank(BankError::ImportDlLastBank));
        }
        let entry_dest = dest.bank(bank_dest)?;
        if entry_dest.bank_type != BankType::Empty && !entry_dest.is_deleted {
            return Err(Error::Bank(BankError::BankNotEmptyOrDeleted));
        }
        let entry_dest2 = dest.bank(bank_dest + 1)?;
        if entry_dest2.bank_type != BankType::Empty && !entry_dest2.is_deleted {
            return Err(Error::Bank(BankError::Bank2DlNotEmptyOrDeleted));
        }
        // NOTE: Not verifying that the two banks are contiguous; lba_len
        // may have been reduced by prior GameCube content.
        if entry_src.lba_len > NHCD_BANK_SIZE_LBA * 2 {
            return Err(Error::Bank(BankError::ImageTooBig));
        }
    } else if entry_src.lba_len > NHCD_BANK_SIZE_LBA {
        return Err(Error::Bank(BankError::ImageTooBig));
    } else if bank_dest == 0
        && bank_count_dest > 8
        && entry_src.lba_len > NHCD_EXTBANKTABLE_BANK_1_SIZE_LBA
    {
        // Bank 1 is capped by the bank table on extended layouts.
        return Err(Error::Bank(BankError::ImageTooBig));
    }

    let entry_dest = dest.bank(bank_dest)?;
    if entry_dest.bank_type != BankType::Empty && !entry_dest.is_deleted {
        return Err(Error::Bank(BankError::BankNotEmptyOrDeleted));
    }

    dest.make_writable()?;

    // Rebuild the destination window to match the source image length.
    let lba_start = entry_dest.lba_start;
    let dest_reader = Reader::open(dest.file.clone(), lba_start, entry_src.lba_len)?;
    let src_reader = entry_src.reader().expect("source bank without reader").clone();

    // Copy the bank metadata.
    let entry_dest = &mut dest.entries[bank_dest as usize];
    entry_dest.lba_len = entry_src.lba_len;
    entry_dest.bank_type = entry_src.bank_type;
    entry_dest.region_code = entry_src.region_code;
    entry_dest.is_deleted = false;
    entry_dest.crypto_type = entry_src.crypto_type;
    entry_dest.sig_type = entry_src.sig_type;
    entry_dest.ios_version = entry_src.ios_version;
    entry_dest.ticket = entry_src.ticket;
    entry_dest.tmd = entry_src.tmd;
    entry_dest.disc_header = entry_src.disc_header.clone();
    entry_dest.timestamp =
        if entry_src.timestamp >= 0 { entry_src.timestamp } else { unix_now() };
    entry_dest.ptbl = entry_src.ptbl.clone();
    entry_dest.reader = Some(dest_reader.clone());

    // Only the source image length is written; wiping the rest of the
    // bank would be pointless.
    let lba_copy_len = entry_src.lba_len;
    let mut state = ProgressState {
        op: ProgressOp::Import,
        bank_src,
        bank_dst: bank_dest,
        lba_processed: 0,
        lba_total: lba_copy_len,
    };
    report(&mut progress, &state)?;

    let mut buf = vec![0u8; BUF_SIZE];
    let lba_buf_max = lba_copy_len.align_down(LBA_COUNT_BUF);
    let mut lba_count = 0;
    while lba_count < lba_buf_max {
        if lba_count != 0 {
            state.lba_processed = lba_count;
            report(&mut progress, &state)?;
        }
        src_reader.read(&mut buf, lba_count, LBA_COUNT_BUF)?;
        dest_reader.write(&buf, lba_count, LBA_COUNT_BUF)?;
        lba_count += LBA_COUNT_BUF;
    }
    if lba_count < lba_copy_len {
        let lba_left = lba_copy_len - lba_count;
        let sz_left = lba_left as usize * LBA_SIZE;
        src_reader.read(&mut buf[..sz_left], lba_count, lba_left)?;
        dest_reader.write(&buf[..sz_left], lba_count, lba_left)?;
    }

    state.lba_processed = lba_copy_len;
    report(&mut progress, &state)?;

    dest_reader.flush()?;
    dest.write_bank_entry(bank_dest)?;
    dest.file.flush().context("Flushing bank table")
}
