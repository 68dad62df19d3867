//! RVT-H image root: open/close and bank table lifecycle.

use std::{mem::size_of, path::Path, sync::Arc};

use tracing::{debug, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{
    bank::BankEntry,
    common::{lba_to_bytes, BankType, CryptoType, LBA_SIZE},
    disc::DiscHeader,
    extract::SDK_HEADER_SIZE_LBA,
    io::{Reader, RefFile},
    nhcd::{
        bank_max_len_lba, bank_start_lba, NhcdBankEntry, NhcdHeader, NHCD_BANKTABLE_ADDRESS_LBA,
        NHCD_BANK_SIZE_LBA, NHCD_BANK_TYPE_EMPTY, NHCD_BANK_TYPE_GCN, NHCD_BANK_TYPE_WII_DL,
        NHCD_BANK_TYPE_WII_SL, NHCD_MAGIC,
    },
    BankError, Error, ErrorContext, Result, ResultContext,
};

/// An opened RVT-H HDD image (or device), or a standalone GameCube/Wii
/// disc image presented as a single bank.
#[derive(Debug)]
pub struct RvtH {
    pub(crate) file: Arc<RefFile>,
    pub(crate) is_hdd: bool,
    pub(crate) bank_count: u32,
    pub(crate) entries: Vec<BankEntry>,
}

impl RvtH {
    /// Opens an RVT-H HDD image, GameCube disc image, or Wii disc image.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = RefFile::open(path)
            .with_context(|| format!("Opening {}", path.display()))?;
        let len = file.len().context("Getting file size")?;
        if len == 0 {
            return Err(Error::Bank(BankError::UnrecognizedFile));
        }
        if len <= 2 * lba_to_bytes(NHCD_BANK_SIZE_LBA) {
            // Two banks or less; most likely a standalone disc image.
            Self::open_gcm(file)
        } else {
            Self::open_hdd(file)
        }
    }

    fn open_gcm(file: Arc<RefFile>) -> Result<Self> {
        let mut reader = Reader::open(file.clone(), 0, 0)?;

        // An NDEV SDK preamble shifts the disc image by 32 KiB.
        let mut first = [0u8; LBA_SIZE];
        reader.read(&mut first, 0, 1)?;
        if !crate::bank::header_has_magic(&first) && sniff_sdk_header(&reader)? {
            debug!("skipping NDEV SDK header");
            reader.lba_adjust(SDK_HEADER_SIZE_LBA)?;
        }

        let mut header = DiscHeader::new_zeroed();
        reader.read(header.as_mut_bytes(), 0, 1)?;
        let bank_type = crate::bank::identify(&header, reader.lba_len());

        let lba_start = reader.lba_start();
        let lba_len = reader.lba_len();
        let entry =
            BankEntry::init(&file, bank_type, lba_start, lba_len, lba_len, -1)?;
        Ok(Self { file, is_hdd: false, bank_count: 1, entries: vec![entry] })
    }

    fn open_hdd(file: Arc<RefFile>) -> Result<Self> {
        let table_base = lba_to_bytes(NHCD_BANKTABLE_ADDRESS_LBA);
        let mut buf = [0u8; LBA_SIZE];
        file.read_at_zero_fill(&mut buf, table_base).context("Reading bank table header")?;
        let header = NhcdHeader::read_from_bytes(&buf).expect("bank table header size mismatch");
        if header.magic != NHCD_MAGIC {
            return Err(Error::Bank(BankError::NhcdTableMagic));
        }

        let bank_count = header.bank_count.get();
        if !(8..=32).contains(&bank_count) {
            // RVT-H systems ship with 8 banks; up to 32 are supported in
            // case the table was extended.
            return Err(Error::Bank(BankError::InvalidBankCount));
        }

        let mut entries: Vec<BankEntry> = Vec::with_capacity(bank_count as usize);
        for i in 0..bank_count {
            if i > 0 && entries[i as usize - 1].bank_type == BankType::WiiDualLayer {
                // Second bank of a dual-layer image; no metadata of its own.
                entries.push(BankEntry::new_dl_bank2(bank_start_lba(i, bank_count)));
                continue;
            }

            let mut buf = [0u8; LBA_SIZE];
            file.read_at_zero_fill(&mut buf, table_base + (1 + i as u64) * LBA_SIZE as u64)
                .with_context(|| format!("Reading bank table entry {i}"))?;
            let raw = NhcdBankEntry::read_from_bytes(&buf).expect("bank entry size mismatch");

            let bank_type = match raw.bank_type.get() {
                NHCD_BANK_TYPE_EMPTY => BankType::Empty,
                NHCD_BANK_TYPE_GCN => BankType::Gcn,
                NHCD_BANK_TYPE_WII_SL => BankType::WiiSingleLayer,
                NHCD_BANK_TYPE_WII_DL => BankType::WiiDualLayer,
                other => {
                    warn!(bank = i, bank_type = other, "unknown bank type");
                    BankType::Unknown
                }
            };

            let (mut lba_start, mut lba_len) = (0, 0);
            if !matches!(bank_type, BankType::Empty | BankType::Unknown) {
                lba_start = raw.lba_start.get();
                lba_len = raw.lba_len.get();
            }
            if lba_start == 0 || lba_len == 0 {
                // No listed LBAs; use the slot's default area and let the
                // disc header determine the length.
                lba_start = bank_start_lba(i, bank_count);
                lba_len = 0;
            }

            entries.push(BankEntry::init(
                &file,
                bank_type,
                lba_start,
                lba_len,
                bank_max_len_lba(i, bank_count),
                raw.timestamp_unix(),
            )?);
        }

        Ok(Self { file, is_hdd: true, bank_count, entries })
    }

    /// Creates a new standalone disc image file of `lba_len` LBAs with a
    /// single empty bank. Used as the destination for extraction.
    pub fn create_gcm(path: impl AsRef<Path>, lba_len: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = RefFile::create(path)
            .with_context(|| format!("Creating {}", path.display()))?;
        let reader = Reader::open(file.clone(), 0, lba_len)?;
        let mut entry = BankEntry::new_empty(0, lba_len);
        entry.reader = Some(reader);
        Ok(Self { file, is_hdd: false, bank_count: 1, entries: vec![entry] })
    }

    /// Whether this is an RVT-H HDD image (or device) rather than a
    /// standalone disc image.
    #[inline]
    pub fn is_hdd(&self) -> bool { self.is_hdd }

    /// Number of banks.
    #[inline]
    pub fn bank_count(&self) -> u32 { self.bank_count }

    /// All bank entries.
    #[inline]
    pub fn banks(&self) -> &[BankEntry] { &self.entries }

    /// A single bank entry.
    pub fn bank(&self, bank: u32) -> Result<&BankEntry> {
        self.entries.get(bank as usize).ok_or_else(bank_out_of_range)
    }

    /// Promotes the underlying file to writable. No-op when already
    /// writable.
    pub fn make_writable(&self) -> Result<()> {
        self.file.make_writable().context("Making file writable")
    }

    /// Rewrites the bank table entry for one bank slot. Only that slot's
    /// 512 bytes are touched.
    pub(crate) fn write_bank_entry(&mut self, bank: u32) -> Result<()> {
        if !self.is_hdd {
            return Err(Error::Bank(BankError::NotHddImage));
        }
        let entry = self.entries.get(bank as usize).ok_or_else(bank_out_of_range)?;
        if entry.bank_type == BankType::WiiDualLayerBank2 {
            return Err(Error::Bank(BankError::BankDl2));
        }

        let mut raw = NhcdBankEntry::new_zeroed();
        let raw_type = if entry.is_deleted || entry.bank_type == BankType::Empty {
            NHCD_BANK_TYPE_EMPTY
        } else {
            match entry.bank_type {
                BankType::Gcn => NHCD_BANK_TYPE_GCN,
                BankType::WiiSingleLayer => NHCD_BANK_TYPE_WII_SL,
                BankType::WiiDualLayer => NHCD_BANK_TYPE_WII_DL,
                _ => NHCD_BANK_TYPE_EMPTY,
            }
        };
        raw.bank_type.set(raw_type);
        raw.revision = entry.disc_header.disc_version;
        raw.region = entry.region_code as u8;
        raw.wii_crypto = match (entry.bank_type.is_wii(), entry.crypto_type) {
            (true, CryptoType::None) => 1,
            _ => 0,
        };
        raw.lba_start.set(entry.lba_start);
        raw.lba_len.set(entry.lba_len);
        raw.set_timestamp_unix(entry.timestamp);

        debug!(bank, raw_type, "writing bank table entry");
        let offset = lba_to_bytes(NHCD_BANKTABLE_ADDRESS_LBA) + (1 + bank as u64) * LBA_SIZE as u64;
        self.file
            .write_at(raw.as_bytes(), offset)
            .with_context(|| format!("Writing bank table entry {bank}"))?;
        debug_assert_eq!(size_of::<NhcdBankEntry>(), LBA_SIZE);
        Ok(())
    }

    /// Marks a bank as deleted. The image data is left in place, so the
    /// bank can be restored with [`RvtH::undelete_bank`].
    pub fn delete_bank(&mut self, bank: u32) -> Result<()> {
        if !self.is_hdd {
            return Err(Error::Bank(BankError::NotHddImage));
        }
        let entry = self.entries.get(bank as usize).ok_or_else(bank_out_of_range)?;
        match entry.bank_type {
            BankType::Empty => return Err(Error::Bank(BankError::BankEmpty)),
            BankType::Unknown => return Err(Error::Bank(BankError::BankUnknown)),
            BankType::WiiDualLayerBank2 => return Err(Error::Bank(BankError::BankDl2)),
            _ => {}
        }
        if entry.is_deleted {
            return Err(Error::Bank(BankError::BankIsDeleted));
        }

        self.make_writable()?;
        self.entries[bank as usize].is_deleted = true;
        self.write_bank_entry(bank)?;
        self.file.flush().context("Flushing bank table")
    }

    /// Restores a deleted bank from its surviving image data.
    pub fn undelete_bank(&mut self, bank: u32) -> Result<()> {
        if !self.is_hdd {
            return Err(Error::Bank(BankError::NotHddImage));
        }
        let entry = self.entries.get(bank as usize).ok_or_else(bank_out_of_range)?;
        if entry.bank_type == BankType::WiiDualLayerBank2 {
            return Err(Error::Bank(BankError::BankDl2));
        }
        if !entry.is_deleted {
            return Err(Error::Bank(BankError::BankNotDeleted));
        }

        self.make_writable()?;
        self.entries[bank as usize].is_deleted = false;
        self.write_bank_entry(bank)?;
        self.file.flush().context("Flushing bank table")
    }
}

pub(crate) fn bank_out_of_range() -> Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, "bank number out of range")
        .context("Bank lookup")
}

/// Probes for the 32 KiB NDEV SDK preamble at the start of a window.
fn sniff_sdk_header(reader: &Reader) -> Result<bool> {
    if reader.lba_len() <= SDK_HEADER_SIZE_LBA {
        return Ok(false);
    }
    let buf = reader.read_bytes(0, 0x848)?;
    Ok(buf[0x0000..0x0004] == [0xFF, 0xFF, 0x00, 0x00]
        && buf[0x082C..0x0830] == [0x00, 0x00, 0xE0, 0x06]
        && buf[0x0844..0x0848] == [0x01, 0x00, 0x00, 0x00])
}
