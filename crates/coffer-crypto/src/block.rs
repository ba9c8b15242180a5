//! Per-block AES-256-GCM seal/open
//!
//! Sealed block format:
//! ```text
//! [16 bytes: random IV][N bytes: ciphertext][16 bytes: GCM tag]
//! AAD = logical block index (8 bytes, little-endian)
//! ```
//!
//! A fresh random IV is drawn for every seal, so rewriting the same block
//! never reuses a key/IV pair and two writes of identical plaintext
//! produce unrelated ciphertext.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;

use crate::kdf::KeyMaterial;
use crate::{IV_SIZE, TAG_SIZE};

type Aead256 = AesGcm<Aes256, U16>;

/// AEAD instance bound to the block key. Stateless besides the key
/// schedule; safe to share behind the volume lock.
pub struct BlockCipher {
    cipher: Aead256,
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

impl BlockCipher {
    pub fn new(block_key: &KeyMaterial) -> Self {
        Self {
            cipher: Aead256::new(block_key.as_bytes().into()),
        }
    }

    /// Seal `plaintext` for logical block `index`.
    ///
    /// Returns `[IV][ciphertext][tag]`, `plaintext.len() + IV_SIZE + TAG_SIZE`
    /// bytes.
    pub fn seal(&self, index: u64, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::<U16>::from_slice(&iv);

        let aad = index.to_le_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow::anyhow!("block encryption failed: {e}"))?;

        let mut sealed = Vec::with_capacity(IV_SIZE + ciphertext.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed block, authenticating it against `index`.
    ///
    /// Fails when any byte of the sealed block was altered, or when the
    /// block was copied from a different logical index.
    pub fn open(&self, index: u64, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
        if sealed.len() < IV_SIZE + TAG_SIZE {
            anyhow::bail!(
                "sealed block too short: {} bytes (minimum {})",
                sealed.len(),
                IV_SIZE + TAG_SIZE
            );
        }

        let (iv, ciphertext) = sealed.split_at(IV_SIZE);
        let nonce = Nonce::<U16>::from_slice(iv);

        let aad = index.to_le_bytes();
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| anyhow::anyhow!("block authentication failed at index {index}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;

    fn test_cipher() -> BlockCipher {
        BlockCipher::new(&KeyMaterial::from_bytes([7u8; KEY_SIZE]))
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = test_cipher();
        let plaintext = b"hello, encrypted block";

        let sealed = cipher.seal(3, plaintext).unwrap();
        let opened = cipher.open(3, &sealed).unwrap();

        assert_eq!(&opened, plaintext);
    }

    #[test]
    fn test_sealed_size() {
        let cipher = test_cipher();
        let sealed = cipher.seal(0, &[0u8; 4064]).unwrap();
        assert_eq!(sealed.len(), IV_SIZE + 4064 + TAG_SIZE);
    }

    #[test]
    fn test_fresh_iv_per_seal() {
        let cipher = test_cipher();
        let plaintext = [9u8; 64];

        let a = cipher.seal(5, &plaintext).unwrap();
        let b = cipher.seal(5, &plaintext).unwrap();

        assert_ne!(a[..IV_SIZE], b[..IV_SIZE], "IV must be fresh per seal");
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_wrong_index() {
        let cipher = test_cipher();
        let sealed = cipher.seal(1, b"positional data").unwrap();

        assert!(
            cipher.open(2, &sealed).is_err(),
            "block moved to another index must fail (AAD mismatch)"
        );
    }

    #[test]
    fn test_open_wrong_key() {
        let sealed = test_cipher().seal(0, b"secret").unwrap();
        let other = BlockCipher::new(&KeyMaterial::from_bytes([8u8; KEY_SIZE]));

        assert!(other.open(0, &sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(0, b"secret data").unwrap();
        sealed[IV_SIZE + 1] ^= 0xFF;

        assert!(cipher.open(0, &sealed).is_err(), "tampered block must fail");
    }

    #[test]
    fn test_tampered_iv() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(0, b"secret data").unwrap();
        sealed[0] ^= 0x01;

        assert!(cipher.open(0, &sealed).is_err());
    }
}
