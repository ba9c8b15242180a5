//! Volume header codec.
//!
//! The header occupies the plaintext region `[0, HEADER_SIZE)`:
//!
//! ```text
//! magic        8   b"cofferfs"
//! version      2   LE
//! cipher       2   LE (1 = AES-256-GCM, 16-byte IV)
//! mem_kib      4   LE  Argon2id memory cost
//! time_cost    4   LE  Argon2id iterations
//! lanes        4   LE  Argon2id parallelism
//! salt        16
//! wrapped_key 64   IV || ciphertext || tag
//! reserved     *   zero
//! ```
//!
//! Written once at creation; rewritten only by a deliberate rekey.

use coffer_core::{FsError, FsResult};
use coffer_crypto::{KdfParams, SALT_SIZE, WRAPPED_KEY_SIZE};

use crate::HEADER_SIZE;

pub const MAGIC: &[u8; 8] = b"cofferfs";
pub const FORMAT_VERSION: u16 = 1;
pub const CIPHER_AES256_GCM: u16 = 1;

const MAGIC_END: usize = 8;
const VERSION_END: usize = MAGIC_END + 2;
const CIPHER_END: usize = VERSION_END + 2;
const MEM_END: usize = CIPHER_END + 4;
const TIME_END: usize = MEM_END + 4;
const LANES_END: usize = TIME_END + 4;
const SALT_END: usize = LANES_END + SALT_SIZE;
const WRAPPED_END: usize = SALT_END + WRAPPED_KEY_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub version: u16,
    pub cipher: u16,
    pub kdf: KdfParams,
    pub salt: [u8; SALT_SIZE],
    pub wrapped_key: [u8; WRAPPED_KEY_SIZE],
}

impl VolumeHeader {
    pub fn new(kdf: KdfParams, salt: [u8; SALT_SIZE], wrapped_key: [u8; WRAPPED_KEY_SIZE]) -> Self {
        Self {
            version: FORMAT_VERSION,
            cipher: CIPHER_AES256_GCM,
            kdf,
            salt,
            wrapped_key,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..MAGIC_END].copy_from_slice(MAGIC);
        buf[MAGIC_END..VERSION_END].copy_from_slice(&self.version.to_le_bytes());
        buf[VERSION_END..CIPHER_END].copy_from_slice(&self.cipher.to_le_bytes());
        buf[CIPHER_END..MEM_END].copy_from_slice(&self.kdf.mem_cost_kib.to_le_bytes());
        buf[MEM_END..TIME_END].copy_from_slice(&self.kdf.time_cost.to_le_bytes());
        buf[TIME_END..LANES_END].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        buf[LANES_END..SALT_END].copy_from_slice(&self.salt);
        buf[SALT_END..WRAPPED_END].copy_from_slice(&self.wrapped_key);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> FsResult<Self> {
        if &buf[..MAGIC_END] != MAGIC {
            return Err(FsError::InvalidHeader("bad magic".into()));
        }
        let version = u16::from_le_bytes([buf[MAGIC_END], buf[MAGIC_END + 1]]);
        if version != FORMAT_VERSION {
            return Err(FsError::InvalidHeader(format!(
                "unsupported format version {version}"
            )));
        }
        let cipher = u16::from_le_bytes([buf[VERSION_END], buf[VERSION_END + 1]]);
        if cipher != CIPHER_AES256_GCM {
            return Err(FsError::InvalidHeader(format!("unknown cipher id {cipher}")));
        }

        let le_u32 = |from: usize| {
            u32::from_le_bytes([buf[from], buf[from + 1], buf[from + 2], buf[from + 3]])
        };
        let kdf = KdfParams {
            mem_cost_kib: le_u32(CIPHER_END),
            time_cost: le_u32(MEM_END),
            parallelism: le_u32(TIME_END),
        };

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&buf[LANES_END..SALT_END]);
        let mut wrapped_key = [0u8; WRAPPED_KEY_SIZE];
        wrapped_key.copy_from_slice(&buf[SALT_END..WRAPPED_END]);

        Ok(Self {
            version,
            cipher,
            kdf,
            salt,
            wrapped_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VolumeHeader {
        VolumeHeader::new(KdfParams::default(), [3u8; SALT_SIZE], [9u8; WRAPPED_KEY_SIZE])
    }

    #[test]
    fn encode_decode_roundtrip() {
        let header = sample();
        let decoded = VolumeHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn kdf_params_survive_roundtrip() {
        let mut header = sample();
        header.kdf = KdfParams {
            mem_cost_kib: 131072,
            time_cost: 5,
            parallelism: 2,
        };
        let decoded = VolumeHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.kdf, header.kdf);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = sample().encode();
        buf[0] = b'X';
        assert!(matches!(
            VolumeHeader::decode(&buf),
            Err(FsError::InvalidHeader(_))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = sample().encode();
        buf[8] = 0xFF;
        assert!(matches!(
            VolumeHeader::decode(&buf),
            Err(FsError::InvalidHeader(_))
        ));
    }

    #[test]
    fn rejects_unknown_cipher() {
        let mut buf = sample().encode();
        buf[10] = 0xFF;
        assert!(matches!(
            VolumeHeader::decode(&buf),
            Err(FsError::InvalidHeader(_))
        ));
    }
}
