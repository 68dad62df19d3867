//! Certificate issuers and signature status.
//!
//! The engine never performs RSA-2048 arithmetic itself; real verification
//! and real signing belong to the PKI tooling around it. What it does
//! implement is the piece the RVT-H workflow depends on: resolving issuer
//! names, classifying signatures (including the zero-prefix "trucha"
//! fakesign), and producing fakesigned blobs when re-signing without a
//! private key.

use std::{ffi::CStr, fmt, mem::size_of};

use tracing::debug;

use crate::{
    common::{SigStatus, SigType},
    disc::wii::{
        SignedHeader, RVL_CERT_ISSUER_DPKI_CA, RVL_CERT_ISSUER_DPKI_TICKET,
        RVL_CERT_ISSUER_DPKI_TMD, RVL_CERT_ISSUER_PPKI_CA, RVL_CERT_ISSUER_PPKI_TICKET,
        RVL_CERT_ISSUER_PPKI_TMD, SIG_TYPE_RSA2048,
    },
    util::digest::sha1_hash,
    BankError, Error, Result,
};

/// A resolved certificate issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Issuer {
    /// Unrecognized issuer string.
    #[default]
    Unknown,
    /// Debug CA. (dpki)
    DpkiCa,
    /// Debug ticket signer. (XS00000006)
    DpkiTicket,
    /// Debug TMD signer. (CP00000007)
    DpkiTmd,
    /// Retail CA. (ppki)
    PpkiCa,
    /// Retail ticket signer. (XS00000003)
    PpkiTicket,
    /// Retail TMD signer. (CP00000004)
    PpkiTmd,
}

impl Issuer {
    /// Resolves a NUL-padded issuer field.
    pub fn from_bytes(issuer: &[u8; 64]) -> Issuer {
        let Some(s) = CStr::from_bytes_until_nul(issuer).ok().and_then(|c| c.to_str().ok())
        else {
            return Issuer::Unknown;
        };
        match s {
            RVL_CERT_ISSUER_DPKI_CA => Issuer::DpkiCa,
            RVL_CERT_ISSUER_DPKI_TICKET => Issuer::DpkiTicket,
            RVL_CERT_ISSUER_DPKI_TMD => Issuer::DpkiTmd,
            RVL_CERT_ISSUER_PPKI_CA => Issuer::PpkiCa,
            RVL_CERT_ISSUER_PPKI_TICKET => Issuer::PpkiTicket,
            RVL_CERT_ISSUER_PPKI_TMD => Issuer::PpkiTmd,
            _ => Issuer::Unknown,
        }
    }

    /// The issuer string as stored on disc.
    pub fn as_str(self) -> &'static str {
        match self {
            Issuer::Unknown => "",
            Issuer::DpkiCa => RVL_CERT_ISSUER_DPKI_CA,
            Issuer::DpkiTicket => RVL_CERT_ISSUER_DPKI_TICKET,
            Issuer::DpkiTmd => RVL_CERT_ISSUER_DPKI_TMD,
            Issuer::PpkiCa => RVL_CERT_ISSUER_PPKI_CA,
            Issuer::PpkiTicket => RVL_CERT_ISSUER_PPKI_TICKET,
            Issuer::PpkiTmd => RVL_CERT_ISSUER_PPKI_TMD,
        }
    }

    /// Writes the issuer string into a NUL-padded on-disc field.
    pub fn write_to(self, field: &mut [u8; 64]) {
        *field = [0; 64];
        let s = self.as_str().as_bytes();
        field[..s.len()].copy_from_slice(s);
    }

    /// Whether this issuer belongs to the debug PKI.
    #[inline]
    pub fn is_debug(self) -> bool {
        matches!(self, Issuer::DpkiCa | Issuer::DpkiTicket | Issuer::DpkiTmd)
    }

    /// The signature regime implied by the issuer.
    pub fn sig_type(self) -> SigType {
        match self {
            Issuer::Unknown => SigType::Unknown,
            i if i.is_debug() => SigType::Debug,
            _ => SigType::Retail,
        }
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Issuer::Unknown {
            write!(f, "(unknown)")
        } else {
            f.write_str(self.as_str())
        }
    }
}

/// Classifies the signature over a signed blob.
///
/// `payload` is the signed region: everything after the [`SignedHeader`],
/// starting with the issuer field. True RSA verification lives outside the
/// engine; here a well-formed non-zero RSA-2048 signature from a known
/// issuer is reported as [`SigStatus::Ok`], while a zeroed signature is
/// classified by the zero-prefix hash trick: a payload hash with a 0x00
/// leading byte passes the buggy firmware comparison.
pub fn sig_verify(header: &SignedHeader, issuer: Issuer, payload: &[u8]) -> SigStatus {
    if header.sig_type.get() != SIG_TYPE_RSA2048 || issuer == Issuer::Unknown {
        return SigStatus::Invalid;
    }
    if header.sig.iter().any(|&b| b != 0) {
        return SigStatus::Ok;
    }
    let hash = sha1_hash(payload);
    if hash[0] == 0x00 {
        SigStatus::Fakesigned
    } else {
        SigStatus::Invalid
    }
}

/// Fakesign search field for tickets: a spare u32 inside the unused
/// padding after the common key index. Part of the signed body, so
/// varying it changes the payload hash.
pub const TICKET_FAKESIGN_OFFSET: usize = 0x1F2;

/// Fakesign search field for TMDs: the tail of the reserved block before
/// the access flags.
pub const TMD_FAKESIGN_OFFSET: usize = 0x1D4;

/// Fakesigns a signed blob in place.
///
/// `blob` is the full structure, [`SignedHeader`] first. The signature is
/// zeroed and a counter in a spare field of the signed body
/// (`search_offset`, e.g. [`TICKET_FAKESIGN_OFFSET`] or
/// [`TMD_FAKESIGN_OFFSET`]) is incremented until the payload SHA-1 gains
/// a 0x00 leading byte, which the buggy strncmp-based firmware comparison
/// accepts. The search field must lie past the signature header so the
/// counter actually feeds the hash.
pub fn fakesign(blob: &mut [u8], search_offset: usize) -> Result<()> {
    const HEADER_SIZE: usize = size_of::<SignedHeader>();
    if blob.len() <= HEADER_SIZE
        || search_offset < HEADER_SIZE
        || search_offset + 4 > blob.len()
    {
        return Err(Error::Bank(BankError::PartitionHeaderCorrupted));
    }
    blob[4..4 + 256].fill(0);
    // The signature type must survive; the firmware checks it first.
    blob[..4].copy_from_slice(&SIG_TYPE_RSA2048.to_be_bytes());

    for counter in 0u32..=u32::MAX {
        blob[search_offset..search_offset + 4].copy_from_slice(&counter.to_le_bytes());
        let hash = sha1_hash(&blob[HEADER_SIZE..]);
        if hash[0] == 0x00 {
            debug!(counter, "fakesign converged");
            return Ok(());
        }
    }
    // With 2^32 attempts over a 1/256 event, unreachable in practice.
    Err(Error::Bank(BankError::PartitionHeaderCorrupted))
}
