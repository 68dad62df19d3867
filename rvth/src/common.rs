//! Common types.

use std::fmt;

/// SHA-1 hash bytes
pub type HashBytes = [u8; 20];

/// AES key bytes
pub type KeyBytes = [u8; 16];

/// Magic bytes
pub type MagicBytes = [u8; 4];

/// Size in bytes of a logical block address. All bank table and reader
/// offsets are expressed in these units.
pub const LBA_SIZE: usize = 512;

/// Converts an LBA count to a byte offset.
#[inline(always)]
pub const fn lba_to_bytes(lba: u32) -> u64 { lba as u64 * LBA_SIZE as u64 }

/// Converts a byte count to an LBA count, ignoring any partial LBA.
#[inline(always)]
pub const fn bytes_to_lba(bytes: u64) -> u32 { (bytes / LBA_SIZE as u64) as u32 }

/// The type of image stored in a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BankType {
    /// Empty bank. May hold a deleted image.
    #[default]
    Empty,
    /// GameCube disc image.
    Gcn,
    /// Wii single-layer disc image.
    WiiSingleLayer,
    /// Wii dual-layer disc image. Occupies this bank and the next.
    WiiDualLayer,
    /// Second bank of a dual-layer Wii disc image.
    WiiDualLayerBank2,
    /// Unrecognized bank type.
    Unknown,
}

impl BankType {
    /// Whether a bank of this type holds Wii content.
    #[inline]
    pub fn is_wii(self) -> bool {
        matches!(self, BankType::WiiSingleLayer | BankType::WiiDualLayer)
    }
}

impl fmt::Display for BankType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankType::Empty => write!(f, "Empty"),
            BankType::Gcn => write!(f, "GameCube"),
            BankType::WiiSingleLayer => write!(f, "Wii (SL)"),
            BankType::WiiDualLayer => write!(f, "Wii (DL)"),
            BankType::WiiDualLayerBank2 => write!(f, "Wii (DL) (2)"),
            BankType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Encryption variant of a Wii disc image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoType {
    /// Encryption status not determined.
    #[default]
    Unknown,
    /// Unencrypted devkit content.
    None,
    /// Debug (dpki) encryption.
    Debug,
    /// Retail (ppki) encryption.
    Retail,
    /// Korean retail encryption.
    Korean,
}

impl fmt::Display for CryptoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoType::Unknown => write!(f, "Unknown"),
            CryptoType::None => write!(f, "None"),
            CryptoType::Debug => write!(f, "Debug"),
            CryptoType::Retail => write!(f, "Retail"),
            CryptoType::Korean => write!(f, "Korean"),
        }
    }
}

/// PKI that issued a ticket signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigType {
    /// Signature issuer not determined.
    #[default]
    Unknown,
    /// Debug (dpki) issuer.
    Debug,
    /// Retail (ppki) issuer.
    Retail,
}

impl fmt::Display for SigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigType::Unknown => write!(f, "Unknown"),
            SigType::Debug => write!(f, "Debug"),
            SigType::Retail => write!(f, "Retail"),
        }
    }
}

/// Verification status of a ticket or TMD signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigStatus {
    /// Signature not checked.
    #[default]
    Unknown,
    /// Signature is valid.
    Ok,
    /// Signature is invalid.
    Invalid,
    /// Signature passes the zero-prefix hash check only (trucha).
    Fakesigned,
}

impl fmt::Display for SigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigStatus::Unknown => write!(f, "Unknown"),
            SigStatus::Ok => write!(f, "OK"),
            SigStatus::Invalid => write!(f, "INVALID"),
            SigStatus::Fakesigned => write!(f, "Fakesigned"),
        }
    }
}

/// Classification of the stream backing a [`Reader`](crate::io::Reader).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// An RVT-H Reader block device.
    HddReader,
    /// An RVT-H Reader HDD image file.
    HddImage,
    /// A standalone GameCube/Wii disc image.
    Gcm,
    /// A standalone disc image prefixed with an NDEV SDK header.
    GcmSdk,
}

/// The kind of Wii disc partition.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PartitionKind {
    /// Data (game) partition.
    Data,
    /// Update partition.
    Update,
    /// Channel partition.
    Channel,
    /// Other partition kind.
    Other(u32),
}

impl From<u32> for PartitionKind {
    #[inline]
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Data,
            1 => Self::Update,
            2 => Self::Channel,
            v => Self::Other(v),
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Update => write!(f, "Update"),
            Self::Channel => write!(f, "Channel"),
            Self::Other(v) => {
                let bytes = v.to_be_bytes();
                write!(f, "Other ({:08X}, {})", v, String::from_utf8_lossy(&bytes))
            }
        }
    }
}

/// The operation reporting progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOp {
    /// Extracting a bank to a standalone disc image.
    Extract,
    /// Importing a standalone disc image into a bank.
    Import,
    /// Re-encrypting Wii partitions.
    Recrypt,
}

/// Progress callback state.
///
/// Delivered at operation start, at every 1 MiB boundary, and at
/// completion. Returning `false` from the callback cancels the operation
/// at the next boundary.
#[derive(Debug, Clone, Copy)]
pub struct ProgressState {
    /// The operation in progress.
    pub op: ProgressOp,
    /// Source bank number.
    pub bank_src: u32,
    /// Destination bank number.
    pub bank_dst: u32,
    /// LBAs processed so far.
    pub lba_processed: u32,
    /// Total LBAs to process.
    pub lba_total: u32,
}

/// Cancelable progress callback. Return `false` to cancel.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(&ProgressState) -> bool;

/// Reborrows a progress callback for a shorter lifetime so the original
/// `Option` can still be used (e.g. moved into a later call) afterwards.
pub(crate) fn reborrow_progress<'a>(
    progress: &'a mut Option<ProgressCallback<'_>>,
) -> Option<ProgressCallback<'a>> {
    match progress {
        Some(cb) => Some(&mut **cb),
        None => None,
    }
}
