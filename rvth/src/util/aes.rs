use tracing::instrument;

use crate::{
    common::KeyBytes,
    disc::{HASHES_SIZE, SECTOR_SIZE},
    util::array_ref,
};

/// Encrypts data in-place using AES-128-CBC with the given key and IV.
pub fn aes_cbc_encrypt(key: &KeyBytes, iv: &KeyBytes, data: &mut [u8]) {
    use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
    assert_eq!(data.len() % 16, 0);
    let len = data.len();
    <cbc::Encryptor<aes::Aes128>>::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .unwrap();
}

/// Decrypts data in-place using AES-128-CBC with the given key and IV.
pub fn aes_cbc_decrypt(key: &KeyBytes, iv: &KeyBytes, data: &mut [u8]) {
    use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
    assert_eq!(data.len() % 16, 0);
    <cbc::Decryptor<aes::Aes128>>::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .unwrap();
}

/// Encrypts a Wii partition sector in-place.
///
/// The hash block is encrypted with a zero IV; the data area uses the IV
/// stored at offset 0x3D0 of the (now encrypted) hash block.
#[instrument(skip_all)]
pub fn encrypt_sector(out: &mut [u8; SECTOR_SIZE], key: &KeyBytes) {
    aes_cbc_encrypt(key, &[0u8; 16], &mut out[..HASHES_SIZE]);
    // Data IV from encrypted hash block
    let iv = *array_ref![out, 0x3D0, 16];
    aes_cbc_encrypt(key, &iv, &mut out[HASHES_SIZE..]);
}

/// Decrypts a Wii partition sector in-place.
#[instrument(skip_all)]
pub fn decrypt_sector(out: &mut [u8; SECTOR_SIZE], key: &KeyBytes) {
    // Data IV from encrypted hash block
    let iv = *array_ref![out, 0x3D0, 16];
    aes_cbc_decrypt(key, &[0u8; 16], &mut out[..HASHES_SIZE]);
    aes_cbc_decrypt(key, &iv, &mut out[HASHES_SIZE..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::wii::DEBUG_COMMON_KEYS;

    #[test]
    fn test_cbc_round_trip() {
        let key: KeyBytes = [0x2b; 16];
        let iv: KeyBytes = [0x01; 16];
        let mut data = [0x5au8; 64];
        let orig = data;
        aes_cbc_encrypt(&key, &iv, &mut data);
        assert_ne!(data, orig);
        aes_cbc_decrypt(&key, &iv, &mut data);
        assert_eq!(data, orig);
    }

    #[test]
    fn test_sector_round_trip() {
        let key = DEBUG_COMMON_KEYS[0];
        let mut sector = vec![0u8; SECTOR_SIZE];
        for (i, b) in sector.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let orig = sector.clone();
        let sector_ref: &mut [u8; SECTOR_SIZE] = sector.as_mut_slice().try_into().unwrap();
        encrypt_sector(sector_ref, &key);
        assert_ne!(&sector[..], &orig[..]);
        let sector_ref: &mut [u8; SECTOR_SIZE] = sector.as_mut_slice().try_into().unwrap();
        decrypt_sector(sector_ref, &key);
        assert_eq!(&sector[..], &orig[..]);
    }
}
