//! Bitmap block allocator.
//!
//! Free-space state lives in superblocks interleaved through the address
//! space every `SUPERBLOCK_INTERVAL` blocks. Bit `j` of superblock `i`
//! owns logical block `i * SUPERBLOCK_INTERVAL + j` (0 = free,
//! 1 = allocated); bit 0 is the superblock itself and is always set.
//! Bits are MSB-first within each byte, so the lowest free index wins
//! deterministically.
//!
//! Bitmap reads and writes go through the block cache and share its
//! flush semantics.

use coffer_core::{BlockId, FsError, FsResult};

use crate::cache::BlockCache;
use crate::device::CryptoBlockDevice;
use crate::{LOGICAL_BLOCK_SIZE, SUPERBLOCK_INTERVAL};

const BITS_PER_SUPERBLOCK: usize = LOGICAL_BLOCK_SIZE * 8;

#[derive(Debug)]
pub struct Allocator {
    /// Lowest index that might be free. Allocation scans start here;
    /// `free` pulls it back down.
    hint: BlockId,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    pub fn new() -> Self {
        Self { hint: 0 }
    }

    /// Open a new superblock region: the whole region becomes addressable
    /// (new blocks stay sparse and unwritten) and its bitmap is all free
    /// except the superblock itself.
    pub fn init_superblock(
        cache: &mut BlockCache,
        dev: &CryptoBlockDevice,
        sb: BlockId,
    ) -> FsResult<()> {
        let region_end = sb
            .checked_add(SUPERBLOCK_INTERVAL)
            .ok_or(FsError::NoSpace)?;
        tracing::debug!(superblock = sb, "opening new bitmap region");
        dev.extend(region_end)?;
        let page = cache.fresh_mut(dev, sb)?;
        set_bit(page, 0);
        Ok(())
    }

    /// Allocate the lowest free logical block, growing the volume by a
    /// new superblock region when every existing bitmap is full.
    pub fn allocate(&mut self, cache: &mut BlockCache, dev: &CryptoBlockDevice) -> FsResult<BlockId> {
        let mut region = self.hint / SUPERBLOCK_INTERVAL;
        let mut start_bit = (self.hint % SUPERBLOCK_INTERVAL) as usize;
        loop {
            let sb = region
                .checked_mul(SUPERBLOCK_INTERVAL)
                .ok_or(FsError::NoSpace)?;
            if sb >= dev.total_blocks()? {
                Self::init_superblock(cache, dev, sb)?;
            }
            let page = cache.get(dev, sb)?;
            if let Some(bit) = find_zero_bit(page, start_bit) {
                let id = sb + bit as u64;
                set_bit(cache.get_mut(dev, sb)?, bit);
                self.hint = id.checked_add(1).ok_or(FsError::NoSpace)?;
                return Ok(id);
            }
            region = region.checked_add(1).ok_or(FsError::NoSpace)?;
            start_bit = 0;
        }
    }

    /// Clear the bitmap bit for `id`. Superblocks themselves cannot be
    /// freed.
    pub fn free(
        &mut self,
        cache: &mut BlockCache,
        dev: &CryptoBlockDevice,
        id: BlockId,
    ) -> FsResult<()> {
        if id % SUPERBLOCK_INTERVAL == 0 {
            return Err(FsError::InvalidArgument);
        }
        let sb = (id / SUPERBLOCK_INTERVAL) * SUPERBLOCK_INTERVAL;
        let bit = (id % SUPERBLOCK_INTERVAL) as usize;
        clear_bit(cache.get_mut(dev, sb)?, bit);
        self.hint = self.hint.min(id);
        Ok(())
    }

    pub fn is_allocated(
        &self,
        cache: &mut BlockCache,
        dev: &CryptoBlockDevice,
        id: BlockId,
    ) -> FsResult<bool> {
        if id >= dev.total_blocks()? {
            return Ok(false);
        }
        let sb = (id / SUPERBLOCK_INTERVAL) * SUPERBLOCK_INTERVAL;
        let bit = (id % SUPERBLOCK_INTERVAL) as usize;
        Ok(test_bit(cache.get(dev, sb)?, bit))
    }

    /// Count free blocks among the currently addressable range.
    pub fn count_free(&self, cache: &mut BlockCache, dev: &CryptoBlockDevice) -> FsResult<u64> {
        let total = dev.total_blocks()?;
        if total == 0 {
            return Ok(0);
        }
        let mut free = 0u64;
        let last_region = (total - 1) / SUPERBLOCK_INTERVAL;
        for region in 0..=last_region {
            let sb = region * SUPERBLOCK_INTERVAL;
            let limit = (total - sb).min(SUPERBLOCK_INTERVAL) as usize;
            let page = cache.get(dev, sb)?;
            for bit in 0..limit {
                if !test_bit(page, bit) {
                    free += 1;
                }
            }
        }
        Ok(free)
    }

    /// Number of superblocks in the addressable range.
    pub fn superblock_count(&self, dev: &CryptoBlockDevice) -> FsResult<u64> {
        let total = dev.total_blocks()?;
        Ok(if total == 0 {
            0
        } else {
            (total - 1) / SUPERBLOCK_INTERVAL + 1
        })
    }
}

#[inline]
fn mask(bit: usize) -> (usize, u8) {
    (bit / 8, 0x80 >> (bit % 8))
}

fn test_bit(bitmap: &[u8; LOGICAL_BLOCK_SIZE], bit: usize) -> bool {
    let (byte, mask) = mask(bit);
    bitmap[byte] & mask != 0
}

fn set_bit(bitmap: &mut [u8; LOGICAL_BLOCK_SIZE], bit: usize) {
    let (byte, mask) = mask(bit);
    bitmap[byte] |= mask;
}

fn clear_bit(bitmap: &mut [u8; LOGICAL_BLOCK_SIZE], bit: usize) {
    let (byte, mask) = mask(bit);
    bitmap[byte] &= !mask;
}

/// Lowest zero bit at or after `from`, MSB-first.
fn find_zero_bit(bitmap: &[u8; LOGICAL_BLOCK_SIZE], from: usize) -> Option<usize> {
    if from >= BITS_PER_SUPERBLOCK {
        return None;
    }
    let mut byte = from / 8;
    // Treat bits before `from` in the first byte as taken.
    let mut masked = bitmap[byte] | !(0xFFu8 >> (from % 8));
    loop {
        if masked != 0xFF {
            return Some(byte * 8 + (!masked).leading_zeros() as usize);
        }
        byte += 1;
        if byte >= LOGICAL_BLOCK_SIZE {
            return None;
        }
        masked = bitmap[byte];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::BackingStore;
    use coffer_crypto::KeyMaterial;
    use tempfile::TempDir;

    fn fresh(dir: &TempDir) -> (CryptoBlockDevice, BlockCache, Allocator) {
        let backing = BackingStore::create(&dir.path().join("vol.coffer")).unwrap();
        let dev = CryptoBlockDevice::new(backing, &KeyMaterial::from_bytes([1u8; 32]));
        let mut cache = BlockCache::new(8);
        Allocator::init_superblock(&mut cache, &dev, 0).unwrap();
        (dev, cache, Allocator::new())
    }

    #[test]
    fn allocates_lowest_free_first() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache, mut alloc) = fresh(&dir);

        assert_eq!(alloc.allocate(&mut cache, &dev).unwrap(), 1);
        assert_eq!(alloc.allocate(&mut cache, &dev).unwrap(), 2);
        assert_eq!(alloc.allocate(&mut cache, &dev).unwrap(), 3);
    }

    #[test]
    fn free_then_reallocate_reuses_lowest() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache, mut alloc) = fresh(&dir);

        for _ in 0..4 {
            alloc.allocate(&mut cache, &dev).unwrap();
        }
        alloc.free(&mut cache, &dev, 2).unwrap();
        assert_eq!(alloc.allocate(&mut cache, &dev).unwrap(), 2);
        assert_eq!(alloc.allocate(&mut cache, &dev).unwrap(), 5);
    }

    #[test]
    fn superblock_cannot_be_freed() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache, mut alloc) = fresh(&dir);
        assert!(matches!(
            alloc.free(&mut cache, &dev, 0),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn is_allocated_tracks_state() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache, mut alloc) = fresh(&dir);

        let id = alloc.allocate(&mut cache, &dev).unwrap();
        assert!(alloc.is_allocated(&mut cache, &dev, id).unwrap());
        assert!(alloc.is_allocated(&mut cache, &dev, 0).unwrap());

        alloc.free(&mut cache, &dev, id).unwrap();
        assert!(!alloc.is_allocated(&mut cache, &dev, id).unwrap());
    }

    #[test]
    fn count_free_matches_allocations() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache, mut alloc) = fresh(&dir);

        // whole region addressable, only the superblock taken
        let before = alloc.count_free(&mut cache, &dev).unwrap();
        assert_eq!(before, SUPERBLOCK_INTERVAL - 1);

        let a = alloc.allocate(&mut cache, &dev).unwrap();
        let b = alloc.allocate(&mut cache, &dev).unwrap();
        assert_eq!(alloc.count_free(&mut cache, &dev).unwrap(), before - 2);

        alloc.free(&mut cache, &dev, a).unwrap();
        alloc.free(&mut cache, &dev, b).unwrap();
        assert_eq!(alloc.count_free(&mut cache, &dev).unwrap(), before);
    }

    #[test]
    fn exhausted_region_grows_a_new_superblock() {
        let dir = TempDir::new().unwrap();
        let (dev, mut cache, mut alloc) = fresh(&dir);

        // Fill region 0 entirely (bit 0 is the superblock itself).
        for _ in 0..(SUPERBLOCK_INTERVAL - 1) {
            alloc.allocate(&mut cache, &dev).unwrap();
        }
        assert_eq!(alloc.superblock_count(&dev).unwrap(), 1);

        // Next allocation crosses into region 1: superblock materializes
        // at SUPERBLOCK_INTERVAL, data block right after it.
        let next = alloc.allocate(&mut cache, &dev).unwrap();
        assert_eq!(next, SUPERBLOCK_INTERVAL + 1);
        assert_eq!(alloc.superblock_count(&dev).unwrap(), 2);
        assert!(alloc
            .is_allocated(&mut cache, &dev, SUPERBLOCK_INTERVAL)
            .unwrap());
    }

    #[test]
    fn find_zero_bit_respects_start() {
        let mut bitmap = [0u8; LOGICAL_BLOCK_SIZE];
        assert_eq!(find_zero_bit(&bitmap, 0), Some(0));
        assert_eq!(find_zero_bit(&bitmap, 13), Some(13));

        set_bit(&mut bitmap, 13);
        assert_eq!(find_zero_bit(&bitmap, 13), Some(14));

        bitmap.fill(0xFF);
        assert_eq!(find_zero_bit(&bitmap, 0), None);
        clear_bit(&mut bitmap, BITS_PER_SUPERBLOCK - 1);
        assert_eq!(find_zero_bit(&bitmap, 0), Some(BITS_PER_SUPERBLOCK - 1));
    }
}
