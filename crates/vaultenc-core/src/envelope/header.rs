//! Envelope header encoding: magic, version, base nonce, authenticated plaintext length.

use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"VENC";
pub const VERSION: u8 = 1;
pub const NONCE_LEN: usize = 12;

pub const CHUNK_SIZE_MIN: u32 = 64 * 1024;
pub const CHUNK_SIZE_MAX: u32 = 10 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("envelope header is truncated")]
    Truncated,
    #[error("bad magic bytes: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported envelope format version {0}")]
    UnsupportedVersion(u8),
    #[error("chunk size {size} outside the allowed range [{CHUNK_SIZE_MIN}, {CHUNK_SIZE_MAX}]")]
    ChunkSizeOutOfRange { size: u32 },
}

pub fn validate_chunk_size(size: u32) -> Result<(), HeaderError> {
    if (CHUNK_SIZE_MIN..=CHUNK_SIZE_MAX).contains(&size) {
        Ok(())
    } else {
        Err(HeaderError::ChunkSizeOutOfRange { size })
    }
}

/// The fixed-size preamble of a `.enc` file: magic, version, base nonce, and the
/// authenticated total plaintext length.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeHeader {
    pub base_nonce: [u8; NONCE_LEN],
    pub plaintext_len: u64,
}

impl EnvelopeHeader {
    pub const ENCODED_LEN: usize = MAGIC.len() + 1 + NONCE_LEN + 8;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        let mut offset = 0;
        out[offset..offset + MAGIC.len()].copy_from_slice(&MAGIC);
        offset += MAGIC.len();
        out[offset] = VERSION;
        offset += 1;
        out[offset..offset + NONCE_LEN].copy_from_slice(&self.base_nonce);
        offset += NONCE_LEN;
        out[offset..offset + 8].copy_from_slice(&self.plaintext_len.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Result<Self, HeaderError> {
        let mut offset = 0;
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[offset..offset + MAGIC.len()]);
        offset += MAGIC.len();
        if magic != MAGIC {
            return Err(HeaderError::BadMagic { expected: MAGIC, found: magic });
        }

        let version = bytes[offset];
        offset += 1;
        if version != VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let mut base_nonce = [0u8; NONCE_LEN];
        base_nonce.copy_from_slice(&bytes[offset..offset + NONCE_LEN]);
        offset += NONCE_LEN;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[offset..offset + 8]);
        let plaintext_len = u64::from_be_bytes(len_bytes);

        Ok(Self { base_nonce, plaintext_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header() {
        let header = EnvelopeHeader { base_nonce: [7u8; NONCE_LEN], plaintext_len: 123_456 };
        let encoded = header.encode();
        let decoded = EnvelopeHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.base_nonce, header.base_nonce);
        assert_eq!(decoded.plaintext_len, header.plaintext_len);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = EnvelopeHeader { base_nonce: [0u8; NONCE_LEN], plaintext_len: 0 }.encode();
        encoded[0] = b'X';
        assert!(matches!(EnvelopeHeader::decode(&encoded), Err(HeaderError::BadMagic { .. })));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut encoded = EnvelopeHeader { base_nonce: [0u8; NONCE_LEN], plaintext_len: 0 }.encode();
        encoded[4] = 99;
        assert!(matches!(EnvelopeHeader::decode(&encoded), Err(HeaderError::UnsupportedVersion(99))));
    }

    #[test]
    fn chunk_size_bounds() {
        assert!(validate_chunk_size(CHUNK_SIZE_MIN).is_ok());
        assert!(validate_chunk_size(CHUNK_SIZE_MAX).is_ok());
        assert!(validate_chunk_size(CHUNK_SIZE_MIN - 1).is_err());
        assert!(validate_chunk_size(CHUNK_SIZE_MAX + 1).is_err());
    }
}
