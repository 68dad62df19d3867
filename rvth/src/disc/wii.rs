//! Wii disc types: tickets, TMDs, partition headers, and common keys.

use std::mem::size_of;

use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    common::{CryptoType, HashBytes, KeyBytes},
    util::{aes::aes_cbc_encrypt, array_ref, static_assert},
    BankError, Error, Result,
};

/// Size in bytes of the H3 table (h3.bin)
pub const H3_TABLE_SIZE: usize = 0x18000;

/// Byte offset of the Wii partition group table.
pub const WII_PART_GROUP_OFF: u64 = 0x40000;

// ppki (Retail)
pub(crate) const RVL_CERT_ISSUER_PPKI_CA: &str = "Root-CA00000001";
pub(crate) const RVL_CERT_ISSUER_PPKI_TICKET: &str = "Root-CA00000001-XS00000003";
pub(crate) const RVL_CERT_ISSUER_PPKI_TMD: &str = "Root-CA00000001-CP00000004";
#[rustfmt::skip]
pub(crate) static RETAIL_COMMON_KEYS: [KeyBytes; 3] = [
    /* RVL_KEY_RETAIL */
    [0xeb, 0xe4, 0x2a, 0x22, 0x5e, 0x85, 0x93, 0xe4, 0x48, 0xd9, 0xc5, 0x45, 0x73, 0x81, 0xaa, 0xf7],
    /* RVL_KEY_KOREAN */
    [0x63, 0xb8, 0x2b, 0xb4, 0xf4, 0x61, 0x4e, 0x2e, 0x13, 0xf2, 0xfe, 0xfb, 0xba, 0x4c, 0x9b, 0x7e],
    /* vWii_KEY_RETAIL */
    [0x30, 0xbf, 0xc7, 0x6e, 0x7c, 0x19, 0xaf, 0xbb, 0x23, 0x16, 0x33, 0x30, 0xce, 0xd7, 0xc2, 0x8d],
];

// dpki (Debug)
pub(crate) const RVL_CERT_ISSUER_DPKI_CA: &str = "Root-CA00000002";
pub(crate) const RVL_CERT_ISSUER_DPKI_TICKET: &str = "Root-CA00000002-XS00000006";
pub(crate) const RVL_CERT_ISSUER_DPKI_TMD: &str = "Root-CA00000002-CP00000007";
#[rustfmt::skip]
pub(crate) static DEBUG_COMMON_KEYS: [KeyBytes; 3] = [
    /* RVL_KEY_DEBUG */
    [0xa1, 0x60, 0x4a, 0x6a, 0x71, 0x23, 0xb5, 0x29, 0xae, 0x8b, 0xec, 0x32, 0xc8, 0x16, 0xfc, 0xaa],
    /* RVL_KEY_KOREAN_DEBUG */
    [0x67, 0x45, 0x8b, 0x6b, 0xc6, 0x23, 0x7b, 0x32, 0x69, 0x98, 0x3c, 0x64, 0x73, 0x48, 0x33, 0x66],
    /* vWii_KEY_DEBUG */
    [0x2f, 0x5c, 0x1b, 0x29, 0x44, 0xe7, 0xfd, 0x6f, 0xc3, 0x97, 0x96, 0x4b, 0x05, 0x76, 0x91, 0xfa],
];

/// Returns the common key for a crypto variant.
pub(crate) fn common_key(crypto: CryptoType) -> Result<&'static KeyBytes> {
    match crypto {
        CryptoType::Debug => Ok(&DEBUG_COMMON_KEYS[0]),
        CryptoType::Retail => Ok(&RETAIL_COMMON_KEYS[0]),
        CryptoType::Korean => Ok(&RETAIL_COMMON_KEYS[1]),
        _ => Err(Error::Bank(BankError::IsUnencrypted)),
    }
}

/// Returns the ticket common key index for a crypto variant.
pub(crate) fn common_key_index(crypto: CryptoType) -> u8 {
    match crypto {
        CryptoType::Korean => 1,
        _ => 0,
    }
}

/// Signed blob header
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct SignedHeader {
    /// Signature type, always 0x00010001 (RSA-2048)
    pub sig_type: U32,
    /// RSA-2048 signature
    pub sig: [u8; 256],
    /// Padding to a 64-byte boundary
    pub sig_pad: [u8; 60],
}

static_assert!(size_of::<SignedHeader>() == 0x140);

/// Signature type of an RSA-2048 signed blob.
pub const SIG_TYPE_RSA2048: u32 = 0x0001_0001;

/// Ticket limit
#[derive(Debug, Clone, PartialEq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct TicketLimit {
    /// Limit type
    pub limit_type: U32,
    /// Maximum value for the limit
    pub max_value: U32,
}

static_assert!(size_of::<TicketLimit>() == 8);

/// Wii ticket
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct Ticket {
    /// Signed blob header
    pub header: SignedHeader,
    /// Signature issuer
    pub sig_issuer: [u8; 64],
    /// ECDH data
    pub ecdh: [u8; 60],
    /// Ticket format version
    pub version: u8,
    _pad1: U16,
    /// Title key (encrypted)
    pub title_key: KeyBytes,
    _pad2: u8,
    /// Ticket ID
    pub ticket_id: [u8; 8],
    /// Console ID
    pub console_id: [u8; 4],
    /// Title ID
    pub title_id: [u8; 8],
    _pad3: U16,
    /// Ticket title version
    pub ticket_title_version: U16,
    /// Permitted titles mask
    pub permitted_titles_mask: U32,
    /// Permit mask
    pub permit_mask: U32,
    /// Title export allowed
    pub title_export_allowed: u8,
    /// Common key index
    pub common_key_idx: u8,
    _pad4: [u8; 48],
    /// Content access permissions
    pub content_access_permissions: [u8; 64],
    _pad5: [u8; 2],
    /// Ticket limits
    pub limits: [TicketLimit; 8],
}

static_assert!(size_of::<Ticket>() == 0x2A4);

impl Ticket {
    /// The AES IV used for title key encryption: title ID followed by zeroes.
    pub fn title_key_iv(&self) -> KeyBytes {
        let mut iv: KeyBytes = [0; 16];
        iv[..8].copy_from_slice(&self.title_id);
        iv
    }

    /// Decrypts the ticket title key using the common key for `crypto`.
    pub fn decrypt_title_key(&self, crypto: CryptoType) -> Result<KeyBytes> {
        let iv = self.title_key_iv();
        let key = match crypto {
            CryptoType::Debug if self.common_key_idx == 1 => &DEBUG_COMMON_KEYS[1],
            CryptoType::Debug => &DEBUG_COMMON_KEYS[0],
            CryptoType::Retail => &RETAIL_COMMON_KEYS[0],
            CryptoType::Korean => &RETAIL_COMMON_KEYS[1],
            _ => return Err(Error::Bank(BankError::IsUnencrypted)),
        };
        let mut title_key = self.title_key;
        crate::util::aes::aes_cbc_decrypt(key, &iv, &mut title_key);
        Ok(title_key)
    }

    /// Re-encrypts a decrypted title key under the common key for `crypto`
    /// and stores it, updating the common key index.
    pub fn set_title_key(&mut self, title_key: &KeyBytes, crypto: CryptoType) -> Result<()> {
        let iv = self.title_key_iv();
        let mut enc = *title_key;
        aes_cbc_encrypt(common_key(crypto)?, &iv, &mut enc);
        self.title_key = enc;
        self.common_key_idx = common_key_index(crypto);
        Ok(())
    }
}

/// Title metadata header
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct TmdHeader {
    /// Signed blob header
    pub header: SignedHeader,
    /// Signature issuer
    pub sig_issuer: [u8; 64],
    /// Version
    pub version: u8,
    /// CA CRL version
    pub ca_crl_version: u8,
    /// Signer CRL version
    pub signer_crl_version: u8,
    /// Is vWii title
    pub is_vwii: u8,
    /// IOS ID
    pub ios_id: [u8; 8],
    /// Title ID
    pub title_id: [u8; 8],
    /// Title type
    pub title_type: u32,
    /// Group ID
    pub group_id: U16,
    _pad1: [u8; 2],
    /// Region
    pub region: U16,
    /// Ratings
    pub ratings: KeyBytes,
    _pad2: [u8; 12],
    /// IPC mask
    pub ipc_mask: [u8; 12],
    _pad3: [u8; 18],
    /// Access flags
    pub access_flags: U32,
    /// Title version
    pub title_version: U16,
    /// Number of contents
    pub num_contents: U16,
    /// Boot index
    pub boot_idx: U16,
    /// Minor version (unused)
    pub minor_version: U16,
}

static_assert!(size_of::<TmdHeader>() == 0x1E4);

impl TmdHeader {
    /// The IOS version the title runs under, from the low word of the
    /// IOS title ID.
    pub fn ios_version(&self) -> u8 {
        let low = u32::from_be_bytes(*array_ref![self.ios_id, 4, 4]);
        low as u8
    }
}

/// TMD content metadata
#[derive(Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct ContentMetadata {
    /// Content ID
    pub content_id: U32,
    /// Content index
    pub content_index: U16,
    /// Content type
    pub content_type: U16,
    /// Content size
    pub size: U64,
    /// Content hash
    pub hash: HashBytes,
}

static_assert!(size_of::<ContentMetadata>() == 0x24);

/// Wii partition header.
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct WiiPartitionHeader {
    /// Ticket
    pub ticket: Ticket,
    /// TMD size in bytes
    pub tmd_size: U32,
    /// TMD offset (>> 2, relative to the partition start)
    pub tmd_off: U32,
    /// Certificate chain size in bytes
    pub cert_chain_size: U32,
    /// Certificate chain offset (>> 2, relative to the partition start)
    pub cert_chain_off: U32,
    /// H3 table offset (>> 2, relative to the partition start)
    pub h3_table_off: U32,
    /// Data offset (>> 2, relative to the partition start)
    pub data_off: U32,
    /// Data size (>> 2)
    pub data_size: U32,
}

static_assert!(size_of::<WiiPartitionHeader>() == 0x2C0);

impl WiiPartitionHeader {
    /// TMD size in bytes
    pub fn tmd_size(&self) -> u64 { self.tmd_size.get() as u64 }

    /// TMD offset in bytes (relative to the partition start)
    pub fn tmd_off(&self) -> u64 { (self.tmd_off.get() as u64) << 2 }

    /// Certificate chain size in bytes
    pub fn cert_chain_size(&self) -> u64 { self.cert_chain_size.get() as u64 }

    /// Certificate chain offset in bytes (relative to the partition start)
    pub fn cert_chain_off(&self) -> u64 { (self.cert_chain_off.get() as u64) << 2 }

    /// H3 table offset in bytes (relative to the partition start)
    pub fn h3_table_off(&self) -> u64 { (self.h3_table_off.get() as u64) << 2 }

    /// H3 table size in bytes (always H3_TABLE_SIZE)
    pub fn h3_table_size(&self) -> u64 { H3_TABLE_SIZE as u64 }

    /// Data offset in bytes (relative to the partition start)
    pub fn data_off(&self) -> u64 { (self.data_off.get() as u64) << 2 }

    /// Data size in bytes
    pub fn data_size(&self) -> u64 { (self.data_size.get() as u64) << 2 }

    /// Sets the data size in bytes.
    pub fn set_data_size(&mut self, size: u64) { self.data_size.set((size >> 2) as u32) }
}
