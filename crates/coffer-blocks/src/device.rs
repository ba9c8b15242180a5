//! The crypto block device: logical plaintext blocks over sealed
//! physical blocks.
//!
//! Stateless besides the block key. Each write seals with a fresh IV;
//! each read authenticates against the logical index, so a block that was
//! tampered with or copied from another position fails with
//! `CorruptBlock`.

use coffer_core::{BlockId, FsError, FsResult};
use coffer_crypto::{BlockCipher, KeyMaterial};

use crate::backing::BackingStore;
use crate::{PageBuf, LOGICAL_BLOCK_SIZE};

#[derive(Debug)]
pub struct CryptoBlockDevice {
    backing: BackingStore,
    cipher: BlockCipher,
}

impl CryptoBlockDevice {
    pub fn new(backing: BackingStore, block_key: &KeyMaterial) -> Self {
        Self {
            backing,
            cipher: BlockCipher::new(block_key),
        }
    }

    pub fn total_blocks(&self) -> FsResult<u64> {
        self.backing.total_blocks()
    }

    /// Make block `to - 1` addressable. New blocks stay unwritten (sparse)
    /// and must not be read before their first write.
    pub fn extend(&self, to: u64) -> FsResult<()> {
        self.backing.extend(to)
    }

    /// Read and authenticate one logical block.
    pub fn read_block(&self, block: BlockId) -> FsResult<PageBuf> {
        let sealed = self.backing.read_physical(block)?;
        let plain = self
            .cipher
            .open(block, &sealed)
            .map_err(|_| FsError::CorruptBlock(block))?;
        plain
            .into_boxed_slice()
            .try_into()
            .map_err(|_| FsError::CorruptBlock(block))
    }

    /// Seal and write one logical block in a single positional write.
    /// `data` shorter than a logical block is zero-padded.
    pub fn write_block(&self, block: BlockId, data: &[u8]) -> FsResult<()> {
        if data.len() > LOGICAL_BLOCK_SIZE {
            return Err(FsError::InvalidArgument);
        }
        let sealed = if data.len() == LOGICAL_BLOCK_SIZE {
            self.cipher
                .seal(block, data)
                .map_err(|_| FsError::CorruptBlock(block))?
        } else {
            let mut padded = [0u8; LOGICAL_BLOCK_SIZE];
            padded[..data.len()].copy_from_slice(data);
            self.cipher
                .seal(block, &padded)
                .map_err(|_| FsError::CorruptBlock(block))?
        };
        self.backing.write_physical(block, &sealed)
    }

    pub fn sync(&self) -> FsResult<()> {
        self.backing.sync()
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PHYSICAL_BLOCK_SIZE;
    use coffer_crypto::IV_SIZE;
    use tempfile::TempDir;

    fn fresh(dir: &TempDir) -> CryptoBlockDevice {
        let backing = BackingStore::create(&dir.path().join("vol.coffer")).unwrap();
        CryptoBlockDevice::new(backing, &KeyMaterial::from_bytes([1u8; 32]))
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let dev = fresh(&dir);

        let mut data = [0u8; LOGICAL_BLOCK_SIZE];
        data[..5].copy_from_slice(b"coffr");
        dev.write_block(0, &data).unwrap();

        assert_eq!(*dev.read_block(0).unwrap(), data);
    }

    #[test]
    fn short_writes_are_zero_padded() {
        let dir = TempDir::new().unwrap();
        let dev = fresh(&dir);

        dev.write_block(0, b"tiny").unwrap();
        let page = dev.read_block(0).unwrap();
        assert_eq!(&page[..4], b"tiny");
        assert!(page[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rewrites_use_fresh_ivs() {
        let dir = TempDir::new().unwrap();
        let dev = fresh(&dir);

        let data = [7u8; LOGICAL_BLOCK_SIZE];
        dev.write_block(0, &data).unwrap();
        let first = dev.backing.read_physical(0).unwrap();
        dev.write_block(0, &data).unwrap();
        let second = dev.backing.read_physical(0).unwrap();

        assert_ne!(first[..IV_SIZE], second[..IV_SIZE]);
        assert_ne!(first, second);
    }

    #[test]
    fn tampering_any_byte_is_detected() {
        let dir = TempDir::new().unwrap();
        let dev = fresh(&dir);
        dev.write_block(0, b"integrity matters").unwrap();

        let mut sealed = dev.backing.read_physical(0).unwrap();
        for &at in &[0usize, IV_SIZE + 3, PHYSICAL_BLOCK_SIZE - 1] {
            sealed[at] ^= 0x40;
            dev.backing.write_physical(0, &sealed).unwrap();
            assert!(
                matches!(dev.read_block(0), Err(FsError::CorruptBlock(0))),
                "flip at {at} must fail authentication"
            );
            sealed[at] ^= 0x40;
        }
        dev.backing.write_physical(0, &sealed).unwrap();
        assert!(dev.read_block(0).is_ok());
    }

    #[test]
    fn block_swap_is_detected() {
        let dir = TempDir::new().unwrap();
        let dev = fresh(&dir);
        dev.write_block(0, b"block zero").unwrap();
        dev.write_block(1, b"block one").unwrap();

        let zero = dev.backing.read_physical(0).unwrap();
        let one = dev.backing.read_physical(1).unwrap();
        dev.backing.write_physical(0, &one).unwrap();
        dev.backing.write_physical(1, &zero).unwrap();

        assert!(matches!(dev.read_block(0), Err(FsError::CorruptBlock(0))));
        assert!(matches!(dev.read_block(1), Err(FsError::CorruptBlock(1))));
    }

    #[test]
    fn oversized_write_rejected() {
        let dir = TempDir::new().unwrap();
        let dev = fresh(&dir);
        let too_big = [0u8; LOGICAL_BLOCK_SIZE + 1];
        assert!(matches!(
            dev.write_block(0, &too_big),
            Err(FsError::InvalidArgument)
        ));
    }
}
