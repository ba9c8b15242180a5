//! Bounded write-back cache of decrypted logical blocks.
//!
//! Pages are plaintext buffers keyed by logical index. A miss decrypts
//! through the device; eviction of a dirty page writes it back first. A
//! failed write-back leaves the page resident and dirty, and the error
//! surfaces to the caller.

use std::num::NonZeroUsize;

use lru::LruCache;

use coffer_core::{BlockId, FsError, FsResult};

use crate::device::CryptoBlockDevice;
use crate::{zero_page, PageBuf, LOGICAL_BLOCK_SIZE};

#[derive(Debug)]
struct Page {
    buf: PageBuf,
    dirty: bool,
}

#[derive(Debug)]
pub struct BlockCache {
    pages: LruCache<BlockId, Page>,
}

impl BlockCache {
    pub fn new(capacity: u32) -> Self {
        Self {
            pages: LruCache::new(cap_of(capacity)),
        }
    }

    /// Read access to a page, decrypting on miss.
    pub fn get(
        &mut self,
        dev: &CryptoBlockDevice,
        id: BlockId,
    ) -> FsResult<&[u8; LOGICAL_BLOCK_SIZE]> {
        self.load(dev, id)?;
        match self.pages.get(&id) {
            Some(page) => Ok(&page.buf),
            None => Err(FsError::CorruptBlock(id)),
        }
    }

    /// Write access to a page; implies `mark_dirty`.
    pub fn get_mut(
        &mut self,
        dev: &CryptoBlockDevice,
        id: BlockId,
    ) -> FsResult<&mut [u8; LOGICAL_BLOCK_SIZE]> {
        self.load(dev, id)?;
        match self.pages.get_mut(&id) {
            Some(page) => {
                page.dirty = true;
                Ok(&mut page.buf)
            }
            None => Err(FsError::CorruptBlock(id)),
        }
    }

    /// Write access to a freshly allocated block: materializes a zeroed
    /// dirty page without touching the (still unwritten) disk block.
    pub fn fresh_mut(
        &mut self,
        dev: &CryptoBlockDevice,
        id: BlockId,
    ) -> FsResult<&mut [u8; LOGICAL_BLOCK_SIZE]> {
        if let Some(page) = self.pages.get_mut(&id) {
            page.buf.fill(0);
            page.dirty = true;
        } else {
            self.make_room(dev)?;
            self.pages.put(
                id,
                Page {
                    buf: zero_page(),
                    dirty: true,
                },
            );
        }
        match self.pages.get_mut(&id) {
            Some(page) => Ok(&mut page.buf),
            None => Err(FsError::CorruptBlock(id)),
        }
    }

    pub fn mark_dirty(&mut self, id: BlockId) {
        if let Some(page) = self.pages.peek_mut(&id) {
            page.dirty = true;
        }
    }

    /// Write every dirty page out in ascending index order. Pages stay
    /// resident and become clean.
    pub fn flush(&mut self, dev: &CryptoBlockDevice) -> FsResult<()> {
        let mut dirty: Vec<BlockId> = self
            .pages
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(id, _)| *id)
            .collect();
        dirty.sort_unstable();
        for id in dirty {
            self.flush_one(dev, id)?;
        }
        Ok(())
    }

    pub fn flush_one(&mut self, dev: &CryptoBlockDevice, id: BlockId) -> FsResult<()> {
        if let Some(page) = self.pages.peek(&id) {
            if page.dirty {
                dev.write_block(id, &*page.buf)?;
                if let Some(page) = self.pages.peek_mut(&id) {
                    page.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Drop a page without writing it. No-op when the page is dirty.
    pub fn drop_clean(&mut self, id: BlockId) {
        let clean = self.pages.peek(&id).map(|p| !p.dirty).unwrap_or(false);
        if clean {
            self.pages.pop(&id);
        }
    }

    /// Resize the cache, writing back any dirty pages that no longer fit.
    pub fn set_capacity(&mut self, dev: &CryptoBlockDevice, capacity: u32) -> FsResult<()> {
        let cap = cap_of(capacity);
        while self.pages.len() > cap.get() {
            self.evict_lru(dev)?;
        }
        self.pages.resize(cap);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn load(&mut self, dev: &CryptoBlockDevice, id: BlockId) -> FsResult<()> {
        if !self.pages.contains(&id) {
            let buf = dev.read_block(id)?;
            self.make_room(dev)?;
            self.pages.put(id, Page { buf, dirty: false });
        }
        Ok(())
    }

    fn make_room(&mut self, dev: &CryptoBlockDevice) -> FsResult<()> {
        while self.pages.len() >= self.pages.cap().get() {
            self.evict_lru(dev)?;
        }
        Ok(())
    }

    fn evict_lru(&mut self, dev: &CryptoBlockDevice) -> FsResult<()> {
        let id = match self.pages.peek_lru() {
            Some((id, _)) => *id,
            None => return Ok(()),
        };
        // Write-back before dropping; on failure the page stays dirty
        // and resident so the caller can retry or abort the volume.
        self.flush_one(dev, id)?;
        self.pages.pop(&id);
        Ok(())
    }
}

fn cap_of(capacity: u32) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(1) as usize).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::BackingStore;
    use coffer_crypto::KeyMaterial;
    use tempfile::TempDir;

    fn fresh(dir: &TempDir, capacity: u32) -> (CryptoBlockDevice, BlockCache) {
        let backing = BackingStore::create(&dir.path().join("vol.coffer")).unwrap();
        let dev = CryptoBlockDevice::new(backing, &KeyMaterial::from_bytes([1u8; 32]));
        (dev, BlockCache::new(capacity))
    }

    #[test]
    fn get_mut_then_get_sees_write() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache) = fresh(&dir, 4);

        cache.fresh_mut(&dev, 0).unwrap()[..2].copy_from_slice(b"hi");
        assert_eq!(&cache.get(&dev, 0).unwrap()[..2], b"hi");
    }

    #[test]
    fn flush_persists_dirty_pages() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache) = fresh(&dir, 4);

        cache.fresh_mut(&dev, 2).unwrap()[0] = 0xAB;
        cache.flush(&dev).unwrap();

        assert_eq!(dev.read_block(2).unwrap()[0], 0xAB);
        // still resident after flush
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_writes_back() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache) = fresh(&dir, 2);

        for id in 0..3u64 {
            cache.fresh_mut(&dev, id).unwrap()[0] = id as u8 + 1;
        }
        // block 0 was evicted to make room for block 2
        assert_eq!(cache.len(), 2);
        assert_eq!(dev.read_block(0).unwrap()[0], 1);
    }

    #[test]
    fn reload_after_eviction() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache) = fresh(&dir, 2);

        for id in 0..3u64 {
            cache.fresh_mut(&dev, id).unwrap()[0] = 0x10 + id as u8;
        }
        assert_eq!(cache.get(&dev, 0).unwrap()[0], 0x10);
    }

    #[test]
    fn drop_clean_ignores_dirty() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache) = fresh(&dir, 4);

        cache.fresh_mut(&dev, 0).unwrap()[0] = 1;
        cache.drop_clean(0);
        assert_eq!(cache.len(), 1, "dirty page must stay");

        cache.flush(&dev).unwrap();
        cache.drop_clean(0);
        assert!(cache.is_empty());
    }

    #[test]
    fn shrink_writes_back_overflow() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache) = fresh(&dir, 4);

        for id in 0..4u64 {
            cache.fresh_mut(&dev, id).unwrap()[0] = id as u8;
        }
        cache.set_capacity(&dev, 1).unwrap();
        assert_eq!(cache.len(), 1);
        for id in 0..3u64 {
            assert_eq!(dev.read_block(id).unwrap()[0], id as u8);
        }
    }
}
