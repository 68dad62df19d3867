//! Bank entries and disc header identification.

use std::{mem::size_of, sync::Arc};

use tracing::warn;
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{
    cert::{sig_verify, Issuer},
    common::{lba_to_bytes, BankType, CryptoType, SigStatus, SigType, LBA_SIZE},
    disc::{
        ptbl::{self, PartitionEntry},
        wii::{SignedHeader, TmdHeader, WiiPartitionHeader},
        DiscHeader, GCN_REGION_OFFSET, WII_REGION_OFFSET,
    },
    io::{Reader, RefFile},
    nhcd::{NHCD_BANK_GCN_SIZE_NR_LBA, NHCD_BANK_SIZE_LBA, NHCD_BANK_WII_SL_SIZE_RVTR_LBA},
    Result,
};

/// Resolved ticket metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketMeta {
    /// Signature issuer.
    pub issuer: Issuer,
    /// Signature verification status.
    pub sig_status: SigStatus,
    /// Title ID.
    pub title_id: [u8; 8],
    /// Title version.
    pub title_version: u16,
}

/// Resolved TMD metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct TmdMeta {
    /// Signature issuer.
    pub issuer: Issuer,
    /// Signature verification status.
    pub sig_status: SigStatus,
    /// Title ID.
    pub title_id: [u8; 8],
    /// Title version.
    pub title_version: u16,
}

/// Metadata for one bank of an RVT-H image, or the sole "bank" of a
/// standalone disc image.
#[derive(Debug)]
pub struct BankEntry {
    /// The type of image in the bank.
    pub bank_type: BankType,
    /// Whether the bank is an empty slot whose prior image data survives.
    pub is_deleted: bool,
    /// Starting LBA of the bank data, relative to the containing file.
    pub lba_start: u32,
    /// Length of the image in LBAs.
    pub lba_len: u32,
    /// Encryption variant of the image.
    pub crypto_type: CryptoType,
    /// PKI of the ticket signature.
    pub sig_type: SigType,
    /// Region code. (GameCube bi2 / Wii region setting)
    pub region_code: u32,
    /// IOS version a Wii title runs under.
    pub ios_version: u8,
    /// Bank timestamp, seconds since the epoch; -1 when unknown.
    pub timestamp: i64,
    /// Cached copy of the bank's first sector.
    pub disc_header: DiscHeader,
    /// Resolved ticket metadata.
    pub ticket: TicketMeta,
    /// Resolved TMD metadata.
    pub tmd: TmdMeta,
    pub(crate) ptbl: Option<Vec<PartitionEntry>>,
    pub(crate) reader: Option<Reader>,
}

impl BankEntry {
    /// Creates a pure-metadata empty entry (no reader).
    pub(crate) fn new_empty(lba_start: u32, lba_len: u32) -> Self {
        Self {
            bank_type: BankType::Empty,
            is_deleted: false,
            lba_start,
            lba_len,
            crypto_type: CryptoType::Unknown,
            sig_type: SigType::Unknown,
            region_code: 0,
            ios_version: 0,
            timestamp: -1,
            disc_header: DiscHeader::new_zeroed(),
            ticket: TicketMeta::default(),
            tmd: TmdMeta::default(),
            ptbl: None,
            reader: None,
        }
    }

    /// Creates the placeholder entry that follows a dual-layer bank.
    pub(crate) fn new_dl_bank2(lba_start: u32) -> Self {
        let mut entry = Self::new_empty(lba_start, 0);
        entry.bank_type = BankType::WiiDualLayerBank2;
        entry
    }

    /// Initializes a bank entry from the on-disk state.
    ///
    /// `table_type` is the type recorded in the bank table (or the
    /// identified type for standalone images); `lba_len == 0` means the
    /// table had no length and one is derived from the disc header.
    /// `max_lba_len` caps the slot.
    pub(crate) fn init(
        file: &Arc<RefFile>,
        table_type: BankType,
        lba_start: u32,
        lba_len: u32,
        max_lba_len: u32,
        timestamp: i64,
    ) -> Result<Self> {
        let window_len = if lba_len != 0 { lba_len } else { max_lba_len };
        let reader = Reader::open(file.clone(), lba_start, window_len)?;

        // Read and identify the first sector.
        let mut header = DiscHeader::new_zeroed();
        reader.read(header.as_mut_bytes(), 0, 1)?;
        let identified = identify(&header, window_len);

        let (bank_type, is_deleted) = match table_type {
            // An "empty" slot whose data still carries a disc magic is a
            // deleted image.
            BankType::Empty if identified != BankType::Empty => (identified, true),
            BankType::Empty => (BankType::Empty, false),
            other => (other, false),
        };

        // Derive a length when the table had none.
        let lba_len = if lba_len != 0 {
            lba_len
        } else {
            match bank_type {
                BankType::Gcn => NHCD_BANK_GCN_SIZE_NR_LBA.min(max_lba_len),
                BankType::WiiDualLayer => 2 * NHCD_BANK_SIZE_LBA,
                _ => max_lba_len,
            }
        };
        let reader =
            if lba_len != window_len { Reader::open(file.clone(), lba_start, lba_len)? } else { reader };

        let mut entry = Self {
            bank_type,
            is_deleted,
            lba_start,
            lba_len,
            crypto_type: CryptoType::Unknown,
            sig_type: SigType::Unknown,
            region_code: 0,
            ios_version: 0,
            timestamp,
            disc_header: header,
            ticket: TicketMeta::default(),
            tmd: TmdMeta::default(),
            ptbl: None,
            reader: Some(reader),
        };

        if entry.bank_type != BankType::Empty && entry.bank_type != BankType::Unknown {
            // Region and crypto are informational; a corrupt partition
            // table should not fail the whole open.
            if let Err(e) = entry.init_region() {
                warn!(bank_type = %entry.bank_type, "failed to read region code: {e}");
            }
            if let Err(e) = entry.init_crypto() {
                warn!(bank_type = %entry.bank_type, "failed to read crypto metadata: {e}");
            }
        }
        Ok(entry)
    }

    /// Game ID from the cached disc header.
    #[inline]
    pub fn game_id_str(&self) -> &str { self.disc_header.game_id_str() }

    /// Game title from the cached disc header.
    #[inline]
    pub fn game_title_str(&self) -> &str { self.disc_header.game_title_str() }

    /// The parsed Wii partition table, if one has been read.
    #[inline]
    pub fn partitions(&self) -> Option<&[PartitionEntry]> { self.ptbl.as_deref() }

    pub(crate) fn reader(&self) -> Option<&Reader> { self.reader.as_ref() }

    /// Ensures the partition table has been parsed, returning it.
    pub(crate) fn require_ptbl(&mut self) -> Result<&[PartitionEntry]> {
        if self.ptbl.is_none() {
            let reader = self.reader.as_ref().expect("bank entry without reader");
            self.ptbl = Some(ptbl::parse(reader, self.lba_len)?);
        }
        Ok(self.ptbl.as_deref().unwrap())
    }

    fn init_region(&mut self) -> Result<()> {
        let reader = self.reader.as_ref().expect("bank entry without reader");
        let offset =
            if self.bank_type.is_wii() { WII_REGION_OFFSET } else { GCN_REGION_OFFSET };
        let buf = reader.read_bytes(offset, 4)?;
        self.region_code = u32::from_be_bytes(buf.try_into().unwrap());
        Ok(())
    }

    fn init_crypto(&mut self) -> Result<()> {
        if !self.bank_type.is_wii() {
            // GameCube discs are never encrypted.
            self.crypto_type = CryptoType::None;
            return Ok(());
        }

        let unencrypted = !self.disc_header.has_partition_encryption()
            || !self.disc_header.has_partition_hashes();

        let ptbl = self.require_ptbl()?;
        let Some(game) = ptbl::find_game(ptbl).copied() else {
            self.crypto_type = if unencrypted { CryptoType::None } else { CryptoType::Unknown };
            return Ok(());
        };

        let reader = self.reader.as_ref().expect("bank entry without reader");
        let buf = reader
            .read_bytes(lba_to_bytes(game.lba_start), size_of::<WiiPartitionHeader>())?;
        let part_header = WiiPartitionHeader::read_from_bytes(buf.as_slice())
            .expect("partition header size mismatch");
        let ticket = &part_header.ticket;

        let issuer = Issuer::from_bytes(&ticket.sig_issuer);
        self.sig_type = issuer.sig_type();
        self.ticket = TicketMeta {
            issuer,
            sig_status: sig_verify(
                &ticket.header,
                issuer,
                &ticket.as_bytes()[size_of::<SignedHeader>()..],
            ),
            title_id: ticket.title_id,
            title_version: ticket.ticket_title_version.get(),
        };

        self.crypto_type = if unencrypted {
            CryptoType::None
        } else {
            match issuer {
                Issuer::DpkiTicket => CryptoType::Debug,
                Issuer::PpkiTicket => match ticket.common_key_idx {
                    1 => CryptoType::Korean,
                    0 => {
                        // Some release tooling writes key index 0 on Korean
                        // discs; fall back to the game ID region letter.
                        if self.disc_header.game_id[3] == b'K' {
                            warn!(
                                game_id = self.game_id_str(),
                                "common key index 0 with region 'K', assuming Korean crypto"
                            );
                            CryptoType::Korean
                        } else {
                            CryptoType::Retail
                        }
                    }
                    _ => CryptoType::Unknown,
                },
                _ => CryptoType::Unknown,
            }
        };

        // TMD follows within the partition header area.
        let tmd_size = part_header.tmd_size();
        if tmd_size >= size_of::<TmdHeader>() as u64 && tmd_size <= 0x10_0000 {
            let buf = reader.read_bytes(
                lba_to_bytes(game.lba_start) + part_header.tmd_off(),
                tmd_size as usize,
            )?;
            let tmd = TmdHeader::read_from_bytes(&buf[..size_of::<TmdHeader>()])
                .expect("TMD header size mismatch");
            let issuer = Issuer::from_bytes(&tmd.sig_issuer);
            self.tmd = TmdMeta {
                issuer,
                sig_status: sig_verify(&tmd.header, issuer, &buf[size_of::<SignedHeader>()..]),
                title_id: tmd.title_id,
                title_version: tmd.title_version.get(),
            };
            self.ios_version = tmd.ios_version();
        }
        Ok(())
    }
}

/// Identifies the image type from a disc header, using the window length
/// to distinguish single- from dual-layer Wii images.
pub(crate) fn identify(header: &DiscHeader, lba_len: u32) -> BankType {
    if header.is_wii() {
        if lba_len > NHCD_BANK_WII_SL_SIZE_RVTR_LBA {
            BankType::WiiDualLayer
        } else {
            BankType::WiiSingleLayer
        }
    } else if header.is_gamecube() {
        BankType::Gcn
    } else {
        BankType::Empty
    }
}

/// Whether a 512-byte disc header sector still carries a disc magic.
/// The RVT-H "Flush" operation zeroes the header of the bank on the
/// device; extraction restores it from the cached copy.
pub(crate) fn header_has_magic(buf: &[u8; LBA_SIZE]) -> bool {
    match DiscHeader::read_from_bytes(buf.as_slice()) {
        Ok(h) => h.is_wii() || h.is_gamecube(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::{GCN_MAGIC, WII_MAGIC};

    fn wii_header() -> DiscHeader {
        let mut header = DiscHeader::new_zeroed();
        header.wii_magic = WII_MAGIC;
        header.game_id = *b"RVTE01";
        header
    }

    #[test]
    fn test_identify() {
        let header = wii_header();
        assert_eq!(identify(&header, 1000), BankType::WiiSingleLayer);
        assert_eq!(
            identify(&header, NHCD_BANK_WII_SL_SIZE_RVTR_LBA + 1),
            BankType::WiiDualLayer
        );

        let mut header = DiscHeader::new_zeroed();
        header.gcn_magic = GCN_MAGIC;
        assert_eq!(identify(&header, 1000), BankType::Gcn);

        let header = DiscHeader::new_zeroed();
        assert_eq!(identify(&header, 1000), BankType::Empty);
    }
}
