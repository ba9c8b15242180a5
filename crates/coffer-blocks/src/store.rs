//! `BlockStore`: the single mutation path for everything above the block
//! layer. Owns the crypto device, the page cache and the allocator so
//! upper layers never juggle the three separately.

use coffer_core::{BlockId, FsResult};
use coffer_crypto::KeyMaterial;

use crate::alloc::Allocator;
use crate::backing::BackingStore;
use crate::cache::BlockCache;
use crate::device::CryptoBlockDevice;
use crate::LOGICAL_BLOCK_SIZE;

pub struct BlockStore {
    dev: CryptoBlockDevice,
    cache: BlockCache,
    alloc: Allocator,
}

impl BlockStore {
    pub fn new(backing: BackingStore, block_key: &KeyMaterial, cache_capacity: u32) -> Self {
        Self {
            dev: CryptoBlockDevice::new(backing, block_key),
            cache: BlockCache::new(cache_capacity),
            alloc: Allocator::new(),
        }
    }

    /// Lay down the first superblock on a fresh volume.
    pub fn format(&mut self) -> FsResult<()> {
        Allocator::init_superblock(&mut self.cache, &self.dev, 0)
    }

    pub fn page(&mut self, id: BlockId) -> FsResult<&[u8; LOGICAL_BLOCK_SIZE]> {
        self.cache.get(&self.dev, id)
    }

    pub fn page_mut(&mut self, id: BlockId) -> FsResult<&mut [u8; LOGICAL_BLOCK_SIZE]> {
        self.cache.get_mut(&self.dev, id)
    }

    /// Zeroed dirty page for a block that has never been written.
    pub fn fresh_page_mut(&mut self, id: BlockId) -> FsResult<&mut [u8; LOGICAL_BLOCK_SIZE]> {
        self.cache.fresh_mut(&self.dev, id)
    }

    pub fn mark_dirty(&mut self, id: BlockId) {
        self.cache.mark_dirty(id);
    }

    pub fn allocate(&mut self) -> FsResult<BlockId> {
        self.alloc.allocate(&mut self.cache, &self.dev)
    }

    pub fn free(&mut self, id: BlockId) -> FsResult<()> {
        self.alloc.free(&mut self.cache, &self.dev, id)
    }

    pub fn is_allocated(&mut self, id: BlockId) -> FsResult<bool> {
        self.alloc.is_allocated(&mut self.cache, &self.dev, id)
    }

    pub fn count_free(&mut self) -> FsResult<u64> {
        self.alloc.count_free(&mut self.cache, &self.dev)
    }

    pub fn superblock_count(&self) -> FsResult<u64> {
        self.alloc.superblock_count(&self.dev)
    }

    pub fn total_blocks(&self) -> FsResult<u64> {
        self.dev.total_blocks()
    }

    pub fn flush(&mut self) -> FsResult<()> {
        self.cache.flush(&self.dev)?;
        self.dev.sync()
    }

    pub fn set_cache_capacity(&mut self, capacity: u32) -> FsResult<()> {
        self.cache.set_capacity(&self.dev, capacity)
    }

    /// Whether corruption at `id` poisons the whole volume: the allocator
    /// bitmaps and the root header are load-bearing for every operation.
    pub fn is_critical(id: BlockId, root: BlockId) -> bool {
        id == root || id % crate::SUPERBLOCK_INTERVAL == 0
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("total_blocks", &self.dev.total_blocks().unwrap_or(0))
            .field("cached_pages", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh(dir: &TempDir) -> BlockStore {
        let backing = BackingStore::create(&dir.path().join("vol.coffer")).unwrap();
        let mut store = BlockStore::new(backing, &KeyMaterial::from_bytes([1u8; 32]), 8);
        store.format().unwrap();
        store
    }

    #[test]
    fn allocate_write_read() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh(&dir);

        let id = store.allocate().unwrap();
        store.fresh_page_mut(id).unwrap()[..4].copy_from_slice(b"data");
        store.flush().unwrap();

        assert_eq!(&store.page(id).unwrap()[..4], b"data");
    }

    #[test]
    fn alloc_free_restores_count() {
        let dir = TempDir::new().unwrap();
        let mut store = fresh(&dir);

        let a = store.allocate().unwrap();
        let before = store.count_free().unwrap();
        let b = store.allocate().unwrap();
        store.fresh_page_mut(b).unwrap()[0] = 1;
        store.flush().unwrap();
        store.free(b).unwrap();

        assert_eq!(store.count_free().unwrap(), before);
        assert!(store.is_allocated(a).unwrap());
    }

    #[test]
    fn critical_blocks() {
        assert!(BlockStore::is_critical(0, 1));
        assert!(BlockStore::is_critical(1, 1));
        assert!(BlockStore::is_critical(crate::SUPERBLOCK_INTERVAL, 1));
        assert!(!BlockStore::is_critical(2, 1));
    }
}
