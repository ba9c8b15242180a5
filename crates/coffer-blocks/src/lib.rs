//! coffer-blocks: the encrypted block layer
//!
//! A volume is one host file: a plaintext header region followed by an
//! array of physical blocks. Each physical block is the AEAD sealing of
//! one logical block, bound to its index. Everything above this crate
//! addresses logical indices only and never sees ciphertext; everything
//! below the cache is purely positional and never sees a path.
//!
//! ```text
//! BlockStore ── allocator (bitmap superblocks)
//!     │      └─ write-back LRU cache of decrypted pages
//!     └──────── CryptoBlockDevice ── BackingStore (host file)
//! ```

pub mod alloc;
pub mod backing;
pub mod cache;
pub mod device;
pub mod header;
pub mod store;

pub use backing::BackingStore;
pub use cache::BlockCache;
pub use device::CryptoBlockDevice;
pub use header::VolumeHeader;
pub use store::BlockStore;

pub use coffer_core::BlockId;

/// One ciphertext unit on disk: `IV || ciphertext || tag`.
pub const PHYSICAL_BLOCK_SIZE: usize = 4096;

/// Plaintext bytes per block, as seen by every layer above this one.
pub const LOGICAL_BLOCK_SIZE: usize =
    PHYSICAL_BLOCK_SIZE - coffer_crypto::IV_SIZE - coffer_crypto::TAG_SIZE;

/// Bytes reserved at the start of the file for the volume header.
/// Logical block 0 starts immediately after.
pub const HEADER_SIZE: usize = PHYSICAL_BLOCK_SIZE;

/// Size of a block id on disk.
pub const BLOCK_ID_SIZE: usize = 8;

/// Distance between bitmap superblocks. Superblock `i` sits at logical
/// index `i * SUPERBLOCK_INTERVAL`; bit `j` of its bitmap owns logical
/// block `i * SUPERBLOCK_INTERVAL + j`. Bit 0 is the superblock itself
/// and is always set.
pub const SUPERBLOCK_INTERVAL: u64 = (LOGICAL_BLOCK_SIZE * 8) as u64;

/// A decrypted logical block held in memory.
pub type PageBuf = Box<[u8; LOGICAL_BLOCK_SIZE]>;

pub(crate) fn zero_page() -> PageBuf {
    Box::new([0u8; LOGICAL_BLOCK_SIZE])
}
