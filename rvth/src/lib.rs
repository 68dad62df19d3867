#![warn(missing_docs)]
//! Library for managing RVT-H Reader bank images and GameCube/Wii disc images.
//!
//! The RVT-H Reader is a Nintendo development HDD that stores up to 8 (or,
//! with an extended bank table, up to 32) disc images in fixed-size banks.
//! This crate provides the bank-aware disc image engine: opening HDD images
//! and standalone GCM files, extracting banks to standalone images with
//! sparse-write optimization, importing standalone images into banks, and
//! re-encrypting Wii partitions between the debug, retail, and Korean
//! crypto variants (including the unencrypted devkit 31K→32K conversion).
//!
//! # Examples
//!
//! Opening an RVT-H HDD image and extracting a bank:
//!
//! ```no_run
//! use rvth::{ExtractOptions, RvtH};
//!
//! let rvth = RvtH::open("path/to/rvth.img").expect("Failed to open image");
//! for i in 0..rvth.bank_count() {
//!     let entry = rvth.bank(i).expect("Bank out of range");
//!     println!("Bank {}: {} {}", i + 1, entry.bank_type, entry.game_id_str());
//! }
//! rvth.extract(0, "out.gcm", None, &ExtractOptions::default(), None)
//!     .expect("Failed to extract bank");
//! ```

pub mod bank;
pub mod cert;
pub mod common;
pub mod disc;
pub mod extract;
pub(crate) mod hashes;
pub mod io;
pub mod nhcd;
pub mod recrypt;
pub mod rvth;
pub(crate) mod util;

pub use bank::BankEntry;
pub use common::{
    BankType, CryptoType, ProgressCallback, ProgressOp, ProgressState, SigStatus, SigType,
};
pub use extract::ExtractOptions;
pub use rvth::RvtH;

const EIO: i32 = 5;
#[cfg(target_os = "macos")]
const ECANCELED: i32 = 89;
#[cfg(not(target_os = "macos"))]
const ECANCELED: i32 = 125;

/// Domain errors from the bank engine.
///
/// Every variant maps to a positive error code via [`BankError::code`];
/// system-level errors are reported separately as [`Error::Io`] and flatten
/// to negative POSIX errnos.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BankError {
    /// The file is not an RVT-H HDD image or GameCube/Wii disc image.
    #[error("unrecognized file format")]
    UnrecognizedFile = 1,
    /// The NHCD bank table header magic is incorrect.
    #[error("bank table magic is incorrect")]
    NhcdTableMagic = 2,
    /// The image contains no banks.
    #[error("no banks found")]
    NoBanks = 3,
    /// The bank status is unknown.
    #[error("bank status is unknown")]
    BankUnknown = 4,
    /// The bank is empty.
    #[error("bank is empty")]
    BankEmpty = 5,
    /// The bank is the second bank of a dual-layer image.
    #[error("bank is second bank of a dual-layer image")]
    BankDl2 = 6,
    /// The operation can only be performed on a device.
    #[error("operation can only be performed on a device, not an image file")]
    NotADevice = 7,
    /// The bank is deleted.
    #[error("bank is deleted")]
    BankIsDeleted = 8,
    /// The bank is not deleted.
    #[error("bank is not deleted")]
    BankNotDeleted = 9,
    /// The RVT-H object is not an HDD image.
    #[error("RVT-H object is not an HDD image")]
    NotHddImage = 10,
    /// The Wii game partition was not found.
    #[error("Wii game partition not found")]
    NoGamePartition = 11,
    /// The RVT-H bank count field is invalid.
    #[error("RVT-H bank count field is invalid")]
    InvalidBankCount = 12,
    /// The operation cannot be performed on devices or HDD images.
    #[error("operation cannot be performed on devices or HDD images")]
    IsHddImage = 13,
    /// A retail-encrypted Wii game cannot be imported.
    #[error("cannot import a retail-encrypted Wii game")]
    IsRetailCrypto = 14,
    /// The source image does not fit in an RVT-H bank.
    #[error("source image does not fit in an RVT-H bank")]
    ImageTooBig = 15,
    /// The destination bank is not empty or deleted.
    #[error("destination bank is not empty or deleted")]
    BankNotEmptyOrDeleted = 16,
    /// A Wii-specific operation was requested on a non-Wii image.
    #[error("Wii-specific operation was requested on a non-Wii image")]
    NotWiiImage = 17,
    /// The image is unencrypted.
    #[error("image is unencrypted")]
    IsUnencrypted = 18,
    /// The image is encrypted.
    #[error("image is encrypted")]
    IsEncrypted = 19,
    /// The Wii partition table is corrupted.
    #[error("Wii partition table is corrupted")]
    PartitionTableCorrupted = 20,
    /// At least one Wii partition header is corrupted.
    #[error("at least one Wii partition header is corrupted")]
    PartitionHeaderCorrupted = 21,
    /// A certificate has an unknown issuer.
    #[error("certificate has an unknown issuer")]
    IssuerUnknown = 22,
    /// Extended bank table: bank 1 cannot hold a dual-layer image.
    #[error("extended bank table: cannot use bank 1 for a dual-layer image")]
    ImportDlExtNoBank1 = 23,
    /// The last bank cannot hold a dual-layer image.
    #[error("cannot use the last bank for a dual-layer image")]
    ImportDlLastBank = 24,
    /// The second bank for a dual-layer image is not empty or deleted.
    #[error("the second bank for the dual-layer image is not empty or deleted")]
    Bank2DlNotEmptyOrDeleted = 25,
    /// The two banks for a dual-layer image are not contiguous.
    #[error("the two banks are not contiguous")]
    ImportDlNotContiguous = 26,
    /// NDEV SDK headers for GameCube images are unsupported.
    #[error("NDEV headers for GCN are currently unsupported")]
    NdevGcnNotSupported = 27,
}

impl BankError {
    /// Positive integer code for the signed-integer error convention.
    #[inline]
    pub fn code(self) -> i32 { self as i32 }
}

/// Error types for rvth.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A domain error from the bank engine.
    #[error(transparent)]
    Bank(#[from] BankError),
    /// A general I/O error.
    #[error("{0}")]
    Io(String, #[source] std::io::Error),
    /// The operation was canceled by the progress callback.
    #[error("operation canceled")]
    Canceled,
}

impl Error {
    /// Flattens the error into the signed-integer convention used by the
    /// RVT-H on-disk tooling: negative POSIX errno for system errors,
    /// positive [`BankError`] code for domain errors.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Bank(e) => e.code(),
            Error::Io(_, e) => -e.raw_os_error().unwrap_or(EIO),
            Error::Canceled => -ECANCELED,
        }
    }
}

/// Helper result type for [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Helper trait for adding context to errors.
pub trait ErrorContext {
    /// Adds context to an error.
    fn context(self, context: impl Into<String>) -> Error;
}

impl ErrorContext for std::io::Error {
    #[inline]
    fn context(self, context: impl Into<String>) -> Error { Error::Io(context.into(), self) }
}

/// Helper trait for adding context to result errors.
pub trait ResultContext<T> {
    /// Adds context to a result error.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Adds context to a result error using a closure.
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String;
}

impl<T, E> ResultContext<T> for Result<T, E>
where E: ErrorContext
{
    #[inline]
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    #[inline]
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_flattening() {
        assert_eq!(Error::Bank(BankError::BankEmpty).errno(), 5);
        assert_eq!(Error::Bank(BankError::NdevGcnNotSupported).errno(), 27);
        let io = Error::Io(
            "read".to_string(),
            std::io::Error::from_raw_os_error(2), // ENOENT
        );
        assert_eq!(io.errno(), -2);
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(BankError::NhcdTableMagic.to_string(), "bank table magic is incorrect");
        assert_eq!(BankError::ImportDlLastBank.to_string(), "cannot use the last bank for a dual-layer image");
    }
}
