//! Volume key generation, wrapping, and subkey derivation

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::KeyMaterial;
use crate::{IV_SIZE, KEY_SIZE, WRAPPED_KEY_SIZE};

type Aead256 = AesGcm<Aes256, U16>;

/// Generate a random 256-bit key (the volume data key).
pub fn generate_key() -> KeyMaterial {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    KeyMaterial::from_bytes(bytes)
}

/// Derive a subkey from `key` via HKDF-SHA256 under a domain string.
///
/// New subkeys (metadata, future per-purpose keys) come from new domain
/// strings without any header format change.
pub fn derive_subkey(key: &KeyMaterial, domain: &[u8]) -> anyhow::Result<KeyMaterial> {
    let hkdf = Hkdf::<Sha256>::new(None, key.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(domain, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(KeyMaterial::from_bytes(okm))
}

/// Wrap (encrypt) the volume key under the key-encryption key.
///
/// Output: `[16-byte IV][ciphertext][16-byte tag]`, `WRAPPED_KEY_SIZE` bytes.
pub fn wrap_key(kek: &KeyMaterial, volume_key: &KeyMaterial) -> anyhow::Result<Vec<u8>> {
    let cipher = Aead256::new(kek.as_bytes().into());

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::<U16>::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, volume_key.as_bytes().as_ref())
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    let mut result = Vec::with_capacity(WRAPPED_KEY_SIZE);
    result.extend_from_slice(&iv);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap (decrypt) the volume key. Fails when the KEK is wrong or the
/// wrapped blob was tampered with; this is the "bad passphrase" signal
/// at mount.
pub fn unwrap_key(kek: &KeyMaterial, wrapped: &[u8]) -> anyhow::Result<KeyMaterial> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        anyhow::bail!(
            "wrapped key has wrong size: {} bytes (expected {})",
            wrapped.len(),
            WRAPPED_KEY_SIZE
        );
    }

    let (iv, ciphertext) = wrapped.split_at(IV_SIZE);
    let nonce = Nonce::<U16>::from_slice(iv);
    let cipher = Aead256::new(kek.as_bytes().into());

    let mut plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("key unwrapping failed: wrong key or corrupted header"))?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        anyhow::bail!("unwrapped key has wrong size: {} bytes", plaintext.len());
    }

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(KeyMaterial::from_bytes(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BLOCK_KEY_DOMAIN, TAG_SIZE};

    fn test_kek() -> KeyMaterial {
        KeyMaterial::from_bytes([42u8; KEY_SIZE])
    }

    #[test]
    fn test_key_generation() {
        let k1 = generate_key();
        let k2 = generate_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_key_wrap_unwrap_roundtrip() {
        let kek = test_kek();
        let volume_key = generate_key();

        let wrapped = wrap_key(&kek, &volume_key).unwrap();
        let unwrapped = unwrap_key(&kek, &wrapped).unwrap();

        assert_eq!(volume_key.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_key_unwrap_wrong_kek() {
        let kek1 = KeyMaterial::from_bytes([1u8; KEY_SIZE]);
        let kek2 = KeyMaterial::from_bytes([2u8; KEY_SIZE]);
        let volume_key = generate_key();

        let wrapped = wrap_key(&kek1, &volume_key).unwrap();
        let result = unwrap_key(&kek2, &wrapped);

        assert!(result.is_err(), "unwrap with wrong KEK must fail");
    }

    #[test]
    fn test_wrapped_key_size() {
        let wrapped = wrap_key(&test_kek(), &generate_key()).unwrap();
        assert_eq!(wrapped.len(), IV_SIZE + KEY_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_subkeys_differ_by_domain() {
        let volume_key = test_kek();
        let block_key = derive_subkey(&volume_key, BLOCK_KEY_DOMAIN).unwrap();
        let other_key = derive_subkey(&volume_key, b"coffer/metadata").unwrap();

        assert_ne!(block_key.as_bytes(), volume_key.as_bytes());
        assert_ne!(
            block_key.as_bytes(),
            other_key.as_bytes(),
            "different domains must produce different keys"
        );
    }
}
