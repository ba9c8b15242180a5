//! coffer-crypto: key schedule and per-block authenticated encryption
//!
//! Key hierarchy:
//! ```text
//! Passphrase ──Argon2id(salt, params)──▶ Key-encryption key
//! Volume key (256-bit random, wrapped by the KEK, stored in the header)
//!   └── Block key (HKDF-SHA256, domain "coffer/blocks")
//!         └── Block AEAD: AES-256-GCM (iv=random 128-bit, AAD=block index)
//! ```
//!
//! Binding the logical block index into the AAD means a ciphertext block
//! only authenticates at the position it was written to: swapping or
//! replaying blocks elsewhere in the volume fails the tag check.

pub mod block;
pub mod kdf;
pub mod keys;

pub use block::BlockCipher;
pub use kdf::{derive_kek, KdfParams, KeyMaterial};
pub use keys::{derive_subkey, generate_key, unwrap_key, wrap_key};

/// Size of every key in the hierarchy (256-bit).
pub const KEY_SIZE: usize = 32;

/// Size of a per-block AES-GCM IV (128-bit).
pub const IV_SIZE: usize = 16;

/// Size of a GCM authentication tag.
pub const TAG_SIZE: usize = 16;

/// Size of the Argon2id salt stored in the volume header.
pub const SALT_SIZE: usize = 16;

/// Size of a wrapped key blob: `IV || ciphertext(32) || TAG`.
pub const WRAPPED_KEY_SIZE: usize = IV_SIZE + KEY_SIZE + TAG_SIZE;

/// HKDF domain string for the block-layer data key.
pub const BLOCK_KEY_DOMAIN: &[u8] = b"coffer/blocks";
