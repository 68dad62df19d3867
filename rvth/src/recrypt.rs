//! Wii partition recryption pipeline.
//!
//! Two operations share this module: re-encrypting partitions between the
//! debug, retail, and Korean crypto variants (ticket/TMD/cert chain
//! rewrite), and converting unencrypted 31 KiB devkit clusters into fully
//! hashed and encrypted 32 KiB clusters during extraction.

use std::mem::size_of;

use tracing::{debug, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{
    cert::{fakesign, Issuer, TICKET_FAKESIGN_OFFSET, TMD_FAKESIGN_OFFSET},
    common::{
        bytes_to_lba, lba_to_bytes, BankType, CryptoType, ProgressCallback, ProgressOp,
        ProgressState, SigStatus, LBA_SIZE,
    },
    disc::{
        ptbl,
        wii::{
            Ticket, TmdHeader, WiiPartitionHeader, H3_TABLE_SIZE, SIG_TYPE_RSA2048,
            WII_PART_GROUP_OFF,
        },
        HASHES_SIZE, SECTOR_DATA_SIZE, SECTOR_GROUP_SIZE, SECTOR_SIZE,
    },
    extract::report,
    hashes::{build_group_hashes, SECTORS_PER_GROUP},
    rvth::RvtH,
    util::{aes::encrypt_sector, array_ref_mut, digest::sha1_hash},
    BankError, Error, ErrorContext, Result, ResultContext,
};

/// Marker block written near the disc header of imported banks so the
/// device firmware treats them as writable devkit content.
pub(crate) const IMPORT_MARKER: &[u8; 32] = b"RVT-H imported disc image\0\0\0\0\0\0\0";

/// Byte offset of the imported-image marker within a bank. Inside the
/// reserved area of the first disc header sector.
pub(crate) const IMPORT_MARKER_OFFSET: u64 = 0x200;

/// Recryption progress of a single partition. Any failure leaves the
/// partition at its last reached state; the pipeline does not roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionState {
    Unread,
    HeaderLoaded,
    KeysDerived,
    ClustersRewritten,
    SignaturesUpdated,
    Done,
}

impl PartitionState {
    fn advance(&mut self, next: PartitionState, index: usize) {
        debug!(partition = index, prev = ?self, state = ?next, "recrypt state");
        *self = next;
    }
}

/// Derives the crypto variant a ticket was issued under.
fn ticket_crypto(ticket: &Ticket) -> Result<CryptoType> {
    match Issuer::from_bytes(&ticket.sig_issuer) {
        Issuer::DpkiTicket => Ok(CryptoType::Debug),
        Issuer::PpkiTicket => {
            if ticket.common_key_idx == 1 {
                Ok(CryptoType::Korean)
            } else {
                Ok(CryptoType::Retail)
            }
        }
        Issuer::Unknown => Err(Error::Bank(BankError::IssuerUnknown)),
        _ => Err(Error::Bank(BankError::PartitionHeaderCorrupted)),
    }
}

fn target_issuers(target: CryptoType) -> (Issuer, Issuer) {
    if target == CryptoType::Debug {
        (Issuer::DpkiTicket, Issuer::DpkiTmd)
    } else {
        (Issuer::PpkiTicket, Issuer::PpkiTmd)
    }
}

impl RvtH {
    /// Re-encrypts every Wii partition of a bank to the `target` crypto
    /// variant, rewriting and re-signing tickets, TMDs, and certificate
    /// chains. Recrypting to the current variant is a no-op.
    ///
    /// Converting to retail requires the retail private key, which is not
    /// shipped with this library; that target fails with
    /// [`BankError::IsRetailCrypto`].
    pub fn recrypt_partitions(
        &mut self,
        bank: u32,
        target: CryptoType,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<()> {
        match target {
            CryptoType::Debug | CryptoType::Korean => {}
            CryptoType::Retail => return Err(Error::Bank(BankError::IsRetailCrypto)),
            CryptoType::None => return Err(Error::Bank(BankError::IsEncrypted)),
            CryptoType::Unknown => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "no recryption target specified",
                )
                .context("Recrypting partitions"));
            }
        }

        let entry = self.bank(bank)?;
        match entry.bank_type {
            BankType::WiiSingleLayer | BankType::WiiDualLayer => {}
            BankType::Empty => return Err(Error::Bank(BankError::BankEmpty)),
            BankType::WiiDualLayerBank2 => return Err(Error::Bank(BankError::BankDl2)),
            BankType::Unknown => return Err(Error::Bank(BankError::BankUnknown)),
            BankType::Gcn => return Err(Error::Bank(BankError::NotWiiImage)),
        }
        if entry.is_deleted {
            return Err(Error::Bank(BankError::BankIsDeleted));
        }
        if entry.crypto_type == CryptoType::None {
            return Err(Error::Bank(BankError::IsUnencrypted));
        }
        if entry.crypto_type == target {
            // Already using the requested variant.
            return Ok(());
        }

        self.make_writable()?;
        let parts = {
            let entry = &mut self.entries[bank as usize];
            entry.require_ptbl()?.to_vec()
        };
        let entry = &self.entries[bank as usize];
        let reader = entry.reader().expect("bank entry without reader").clone();

        let mut state = ProgressState {
            op: ProgressOp::Recrypt,
            bank_src: bank,
            bank_dst: bank,
            lba_processed: 0,
            lba_total: entry.lba_len,
        };
        report(&mut progress, &state)?;

        let (ticket_issuer, tmd_issuer) = target_issuers(target);
        for (index, part) in parts.iter().enumerate() {
            let mut pstate = PartitionState::Unread;
            state.lba_processed = part.lba_start;
            report(&mut progress, &state)?;

            let base = lba_to_bytes(part.lba_start);
            let buf = reader.read_bytes(base, size_of::<WiiPartitionHeader>())?;
            let header = WiiPartitionHeader::read_from_bytes(buf.as_slice())
                .expect("partition header size mismatch");
            if header.ticket.header.sig_type.get() != SIG_TYPE_RSA2048 {
                return Err(Error::Bank(BankError::PartitionHeaderCorrupted));
            }
            pstate.advance(PartitionState::HeaderLoaded, index);

            // The title key itself is preserved; only the common key
            // wrapping it changes. Decrypt under the source variant and
            // re-wrap under the target.
            let source = ticket_crypto(&header.ticket)?;
            let title_key = header.ticket.decrypt_title_key(source)?;
            let mut ticket = header.ticket.clone();
            ticket.set_title_key(&title_key, target)?;
            ticket_issuer.write_to(&mut ticket.sig_issuer);
            pstate.advance(PartitionState::KeysDerived, index);

            // Cluster data is encrypted with the title key, which did not
            // change; the stored ciphertext and hash tree remain valid.
            let new_title_key = ticket.decrypt_title_key(target)?;
            debug_assert_eq!(new_title_key, title_key);
            pstate.advance(PartitionState::ClustersRewritten, index);

            fakesign(ticket.as_mut_bytes(), TICKET_FAKESIGN_OFFSET)?;
            reader.write_bytes(ticket.as_bytes(), base)?;

            // TMD: new issuer, re-signed.
            let tmd_size = header.tmd_size();
            if tmd_size < size_of::<TmdHeader>() as u64 || tmd_size > 0x10_0000 {
                return Err(Error::Bank(BankError::PartitionHeaderCorrupted));
            }
            let mut tmd_buf = reader.read_bytes(base + header.tmd_off(), tmd_size as usize)?;
            {
                let mut tmd = TmdHeader::read_from_bytes(&tmd_buf[..size_of::<TmdHeader>()])
                    .expect("TMD header size mismatch");
                tmd_issuer.write_to(&mut tmd.sig_issuer);
                tmd_buf[..size_of::<TmdHeader>()].copy_from_slice(tmd.as_bytes());
            }
            fakesign(&mut tmd_buf, TMD_FAKESIGN_OFFSET)?;
            reader.write_bytes(&tmd_buf, base + header.tmd_off())?;

            // Certificate chain: point the certs at the target CA.
            let chain_size = header.cert_chain_size();
            if chain_size > 0 && chain_size <= 0x4000 {
                let mut chain =
                    reader.read_bytes(base + header.cert_chain_off(), chain_size as usize)?;
                rewrite_cert_chain(&mut chain, target);
                reader.write_bytes(&chain, base + header.cert_chain_off())?;
            }
            pstate.advance(PartitionState::SignaturesUpdated, index);
            pstate.advance(PartitionState::Done, index);
        }

        reader.flush()?;

        // Refresh the cached metadata to match what was written.
        let entry = &mut self.entries[bank as usize];
        entry.crypto_type = target;
        entry.sig_type = ticket_issuer.sig_type();
        entry.ticket.issuer = ticket_issuer;
        entry.ticket.sig_status = SigStatus::Ok;
        entry.tmd.issuer = tmd_issuer;
        entry.tmd.sig_status = SigStatus::Ok;

        if self.is_hdd {
            self.write_bank_entry(bank)?;
            self.file.flush().context("Flushing bank table")?;
        }

        state.lba_processed = state.lba_total;
        report(&mut progress, &state)?;
        Ok(())
    }

    /// Stamps the imported-image marker into a bank so the device
    /// firmware treats the content as writable devkit data.
    pub fn recrypt_id(&mut self, bank: u32) -> Result<()> {
        let entry = self.bank(bank)?;
        match entry.bank_type {
            BankType::Empty => return Err(Error::Bank(BankError::BankEmpty)),
            BankType::WiiDualLayerBank2 => return Err(Error::Bank(BankError::BankDl2)),
            BankType::Unknown => return Err(Error::Bank(BankError::BankUnknown)),
            _ => {}
        }

        self.make_writable()?;
        let reader = entry.reader().expect("bank entry without reader").clone();
        reader.write_bytes(IMPORT_MARKER, IMPORT_MARKER_OFFSET)?;
        reader.flush()?;

        if self.is_hdd {
            self.write_bank_entry(bank)?;
            self.file.flush().context("Flushing bank table")?;
        }
        Ok(())
    }
}

/// Rewrites the issuer and name fields of every certificate in a chain to
/// reference the target PKI. The chain layout is left untouched when a
/// certificate fails to parse.
fn rewrite_cert_chain(chain: &mut [u8], target: CryptoType) {
    let mut off = 0usize;
    while off + 4 <= chain.len() {
        let sig_type = u32::from_be_bytes(chain[off..off + 4].try_into().unwrap());
        let sig_skip = match sig_type {
            0x0001_0000 => 4 + 512 + 60, // RSA-4096
            0x0001_0001 => 4 + 256 + 60, // RSA-2048
            0x0001_0002 => 4 + 64 + 64,  // ECC-B233
            _ => {
                warn!(offset = off, sig_type, "unrecognized certificate signature type");
                return;
            }
        };
        let issuer_off = off + sig_skip;
        let key_type_off = issuer_off + 64;
        let name_off = key_type_off + 4;
        if name_off + 64 > chain.len() {
            return;
        }
        rewrite_issuer_field(array_ref_mut![chain, issuer_off, 64], target);
        rewrite_issuer_field(array_ref_mut![chain, name_off, 64], target);

        let key_type =
            u32::from_be_bytes(chain[key_type_off..key_type_off + 4].try_into().unwrap());
        let key_size = match key_type {
            0 => 512 + 4 + 52, // RSA-4096
            1 => 256 + 4 + 52, // RSA-2048
            2 => 60 + 60,      // ECC-B233
            _ => {
                warn!(offset = off, key_type, "unrecognized certificate key type");
                return;
            }
        };
        off = name_off + 64 + key_size;
    }
}

/// Swaps PKI name components within a NUL-padded issuer/name field.
fn rewrite_issuer_field(field: &mut [u8; 64], target: CryptoType) {
    let debug = target == CryptoType::Debug;
    let swaps: [(&[u8], &[u8]); 3] = if debug {
        [(b"CA00000001", b"CA00000002"), (b"XS00000003", b"XS00000006"), (b"CP00000004", b"CP00000007")]
    } else {
        [(b"CA00000002", b"CA00000001"), (b"XS00000006", b"XS00000003"), (b"CP00000007", b"CP00000004")]
    };
    for (from, to) in swaps {
        let len = from.len();
        let mut i = 0;
        while i + len <= field.len() {
            if &field[i..i + len] == from {
                field[i..i + len].copy_from_slice(to);
                i += len;
            } else {
                i += 1;
            }
        }
    }
}

/// Copies an unencrypted Wii bank to a standalone image, converting the
/// 31 KiB devkit clusters of the game partition into hashed, encrypted
/// 32 KiB clusters.
pub(crate) fn copy_to_gcm_encrypting(
    dest: &mut RvtH,
    src: &RvtH,
    bank_src: u32,
    mut progress: Option<ProgressCallback<'_>>,
) -> Result<()> {
    if dest.is_hdd() || dest.bank_count() != 1 {
        return Err(Error::Bank(BankError::IsHddImage));
    }
    let entry_src = src.bank(bank_src)?;
    match entry_src.bank_type {
        BankType::WiiSingleLayer | BankType::WiiDualLayer => {}
        BankType::Gcn => return Err(Error::Bank(BankError::NotWiiImage)),
        BankType::Empty => return Err(Error::Bank(BankError::BankEmpty)),
        BankType::WiiDualLayerBank2 => return Err(Error::Bank(BankError::BankDl2)),
        BankType::Unknown => return Err(Error::Bank(BankError::BankUnknown)),
    }
    if entry_src.crypto_type != CryptoType::None {
        return Err(Error::Bank(BankError::IsEncrypted));
    }
    let game = entry_src
        .partitions()
        .and_then(ptbl::find_game)
        .copied()
        .ok_or(Error::Bank(BankError::NoGamePartition))?;

    let src_reader = entry_src.reader().expect("source bank without reader").clone();
    let dest_reader = dest.entries[0].reader.as_ref().expect("destination without reader").clone();
    dest.file
        .make_sparse(lba_to_bytes(dest_reader.lba_start() + dest_reader.lba_len()))
        .context("Making destination sparse")?;

    // Partition header (ticket, TMD, cert chain) from the source.
    let base = lba_to_bytes(game.lba_start);
    let mut pthdr_buf = src_reader.read_bytes(base, 0x8000)?;
    let (mut header, tmd_off, tmd_size) = {
        let header =
            WiiPartitionHeader::read_from_bytes(&pthdr_buf[..size_of::<WiiPartitionHeader>()])
                .expect("partition header size mismatch");
        if header.ticket.header.sig_type.get() != SIG_TYPE_RSA2048
            || header.tmd_off() + header.tmd_size() > 0x8000
        {
            return Err(Error::Bank(BankError::PartitionHeaderCorrupted));
        }
        let (tmd_off, tmd_size) = (header.tmd_off() as usize, header.tmd_size() as usize);
        (header, tmd_off, tmd_size)
    };
    if tmd_size < size_of::<TmdHeader>() {
        return Err(Error::Bank(BankError::PartitionHeaderCorrupted));
    }
    let source_crypto = ticket_crypto(&header.ticket)?;
    let title_key = header.ticket.decrypt_title_key(source_crypto)?;

    // Destination layout: 0x8000 partition header, 0x18000 H3 table, then
    // 2 MiB sector groups.
    let raw_lba = game.lba_len - bytes_to_lba(0x8000);
    let groups = raw_lba.div_ceil(3968);
    let data_out_lba = groups * 4096;
    if groups as usize > H3_TABLE_SIZE / 20 {
        return Err(Error::Bank(BankError::ImageTooBig));
    }

    let total_lba = dest.entries[0].lba_len;
    let mut state = ProgressState {
        op: ProgressOp::Extract,
        bank_src,
        bank_dst: 0,
        lba_processed: 0,
        lba_total: total_lba,
    };
    report(&mut progress, &state)?;

    // Copy everything before the game partition verbatim.
    {
        let mut buf = vec![0u8; 1048576];
        let chunk_lba = (buf.len() / LBA_SIZE) as u32;
        let mut lba = 0u32;
        while lba < game.lba_start {
            let n = chunk_lba.min(game.lba_start - lba);
            src_reader.read(&mut buf[..n as usize * LBA_SIZE], lba, n)?;
            if lba == 0 && !crate::bank::header_has_magic(buf[..LBA_SIZE].try_into().unwrap()) {
                buf[..LBA_SIZE].copy_from_slice(entry_src.disc_header.as_bytes());
            }
            dest_reader.write(&buf[..n as usize * LBA_SIZE], lba, n)?;
            lba += n;
            state.lba_processed = lba;
            report(&mut progress, &state)?;
        }
    }

    // The output is a normal encrypted disc image.
    dest_reader.write_bytes(&[0u8, 0u8], 0x60)?;

    // Rewrite the partition table to list only the game partition.
    {
        let mut table = [0u8; 0x28];
        table[0..4].copy_from_slice(&1u32.to_be_bytes()); // group 0 count
        table[4..8].copy_from_slice(&((WII_PART_GROUP_OFF as u32 + 0x20) >> 2).to_be_bytes());
        table[0x20..0x24].copy_from_slice(&((lba_to_bytes(game.lba_start) >> 2) as u32).to_be_bytes());
        // kind 0 (data) is already zero
        dest_reader.write_bytes(&table, WII_PART_GROUP_OFF)?;
    }

    // Convert the partition data, collecting the H3 table.
    let mut h3_table = vec![0u8; H3_TABLE_SIZE];
    {
        let mut raw = <[u8; 3968 * LBA_SIZE]>::new_box_zeroed()
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::OutOfMemory))
            .context("Allocating group buffer")?;
        let mut group = <[u8; SECTOR_GROUP_SIZE]>::new_box_zeroed()
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::OutOfMemory))
            .context("Allocating group buffer")?;
        let raw_base = game.lba_start + bytes_to_lba(0x8000);
        let data_base = game.lba_start + bytes_to_lba(0x20000);
        for g in 0..groups {
            state.lba_processed = data_base + g * 4096;
            report(&mut progress, &state)?;

            // Read up to one group of raw 31 KiB clusters, zero-padding
            // the final partial group.
            let src_lba = raw_base + g * 3968;
            let n = 3968.min(raw_lba - g * 3968);
            raw[n as usize * LBA_SIZE..].fill(0);
            src_reader.read(&mut raw[..n as usize * LBA_SIZE], src_lba, n)?;

            for s in 0..SECTORS_PER_GROUP {
                let sector = array_ref_mut![group, s * SECTOR_SIZE, SECTOR_SIZE];
                sector[..HASHES_SIZE].fill(0);
                sector[HASHES_SIZE..]
                    .copy_from_slice(&raw[s * SECTOR_DATA_SIZE..(s + 1) * SECTOR_DATA_SIZE]);
            }
            let h3 = build_group_hashes(&mut group);
            h3_table[g as usize * 20..g as usize * 20 + 20].copy_from_slice(&h3);
            for s in 0..SECTORS_PER_GROUP {
                let sector = array_ref_mut![group, s * SECTOR_SIZE, SECTOR_SIZE];
                encrypt_sector(sector, &title_key);
            }
            dest_reader.write(group.as_slice(), data_base + g * 4096, 4096)?;
        }
    }

    // H3 table, then the patched partition header.
    dest_reader.write_bytes(&h3_table, base + 0x8000)?;

    header.h3_table_off.set((0x8000u32) >> 2);
    header.data_off.set((0x20000u32) >> 2);
    header.set_data_size(lba_to_bytes(data_out_lba));
    pthdr_buf[..size_of::<WiiPartitionHeader>()].copy_from_slice(header.as_bytes());

    // The TMD's content record carries the H3 table hash; update and
    // re-sign it.
    {
        let tmd_region = &mut pthdr_buf[tmd_off..tmd_off + tmd_size];
        let num_contents = {
            let tmd = TmdHeader::read_from_bytes(&tmd_region[..size_of::<TmdHeader>()])
                .map_err(|_| Error::Bank(BankError::PartitionHeaderCorrupted))?;
            tmd.num_contents.get() as usize
        };
        if num_contents >= 1 && size_of::<TmdHeader>() + 0x24 <= tmd_size {
            let hash_off = size_of::<TmdHeader>() + 0x10;
            tmd_region[hash_off..hash_off + 20].copy_from_slice(&sha1_hash(&h3_table));
        }
        fakesign(tmd_region, TMD_FAKESIGN_OFFSET)?;
    }
    dest_reader.write_bytes(&pthdr_buf, base)?;

    // Copy the bank metadata; the output is now encrypted under the
    // ticket's original (usually debug) variant.
    let entry_dest = &mut dest.entries[0];
    entry_dest.bank_type = entry_src.bank_type;
    entry_dest.region_code = entry_src.region_code;
    entry_dest.is_deleted = false;
    entry_dest.crypto_type = source_crypto;
    entry_dest.sig_type = entry_src.sig_type;
    entry_dest.ios_version = entry_src.ios_version;
    entry_dest.ticket = entry_src.ticket;
    entry_dest.tmd = entry_src.tmd;
    entry_dest.disc_header = entry_src.disc_header.clone();
    entry_dest.disc_header.no_partition_hashes = 0;
    entry_dest.disc_header.no_partition_encryption = 0;
    entry_dest.timestamp =
        if entry_src.timestamp >= 0 { entry_src.timestamp } else { crate::extract::unix_now() };

    state.lba_processed = total_lba;
    report(&mut progress, &state)?;
    dest_reader.flush()
}
