use sha1::Digest;

use crate::common::HashBytes;

/// Hashes a byte slice with SHA-1.
pub fn sha1_hash(buf: &[u8]) -> HashBytes { HashBytes::from(sha1::Sha1::digest(buf)) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_empty() {
        assert_eq!(sha1_hash(&[]), [
            0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60,
            0x18, 0x90, 0xaf, 0xd8, 0x07, 0x09
        ]);
    }
}
