//! Positional whole-block I/O over the host file.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;

use coffer_core::{BlockId, FsError, FsResult};

use crate::{HEADER_SIZE, PHYSICAL_BLOCK_SIZE};

/// The host file holding the volume: a header region followed by whole
/// physical blocks. All I/O is positional (`pread`/`pwrite`); the store
/// keeps no seek position.
#[derive(Debug)]
pub struct BackingStore {
    file: File,
}

impl BackingStore {
    /// Open an existing volume file. The length past the header must be a
    /// whole number of physical blocks.
    pub fn open(path: &Path, read_only: bool) -> FsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            return Err(FsError::InvalidHeader("file shorter than header".into()));
        }
        if (len - HEADER_SIZE as u64) % PHYSICAL_BLOCK_SIZE as u64 != 0 {
            return Err(FsError::InvalidHeader(
                "file length is not a whole number of blocks".into(),
            ));
        }
        Ok(Self { file })
    }

    /// Create a fresh volume file. Fails if the path already exists.
    pub fn create(path: &Path) -> FsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(HEADER_SIZE as u64)?;
        Ok(Self { file })
    }

    fn block_offset(block: BlockId) -> FsResult<u64> {
        block
            .checked_mul(PHYSICAL_BLOCK_SIZE as u64)
            .and_then(|o| o.checked_add(HEADER_SIZE as u64))
            .ok_or(FsError::NoSpace)
    }

    /// Number of addressable physical blocks (file length past the header).
    pub fn total_blocks(&self) -> FsResult<u64> {
        let len = self.file.metadata()?.len();
        Ok(len.saturating_sub(HEADER_SIZE as u64) / PHYSICAL_BLOCK_SIZE as u64)
    }

    /// Grow the file so block `to - 1` is addressable. Never shrinks.
    /// Newly exposed blocks are sparse until first written.
    pub fn extend(&self, to: u64) -> FsResult<()> {
        let want = Self::block_offset(to)?;
        if want > self.file.metadata()?.len() {
            self.file.set_len(want)?;
        }
        Ok(())
    }

    pub fn read_physical(&self, block: BlockId) -> FsResult<[u8; PHYSICAL_BLOCK_SIZE]> {
        let offset = Self::block_offset(block)?;
        let mut buf = [0u8; PHYSICAL_BLOCK_SIZE];
        let mut got = 0;
        while got < buf.len() {
            match self.file.read_at(&mut buf[got..], offset + got as u64) {
                Ok(0) => {
                    return Err(FsError::ShortRead {
                        block,
                        got,
                        want: PHYSICAL_BLOCK_SIZE,
                    })
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    /// Write one physical block in a single positional write.
    pub fn write_physical(&self, block: BlockId, data: &[u8]) -> FsResult<()> {
        debug_assert_eq!(data.len(), PHYSICAL_BLOCK_SIZE);
        let offset = Self::block_offset(block)?;
        let mut put = 0;
        while put < data.len() {
            match self.file.write_at(&data[put..], offset + put as u64) {
                Ok(0) => {
                    return Err(FsError::ShortWrite {
                        block,
                        got: put,
                        want: PHYSICAL_BLOCK_SIZE,
                    })
                }
                Ok(n) => put += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn read_header(&self) -> FsResult<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(buf)
    }

    pub fn write_header(&self, data: &[u8; HEADER_SIZE]) -> FsResult<()> {
        self.file.write_all_at(data, 0)?;
        Ok(())
    }

    pub fn sync(&self) -> FsResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh(dir: &TempDir) -> BackingStore {
        BackingStore::create(&dir.path().join("vol.coffer")).unwrap()
    }

    #[test]
    fn create_then_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.coffer");
        {
            let store = BackingStore::create(&path).unwrap();
            assert_eq!(store.total_blocks().unwrap(), 0);
        }
        let store = BackingStore::open(&path, false).unwrap();
        assert_eq!(store.total_blocks().unwrap(), 0);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.coffer");
        BackingStore::create(&path).unwrap();
        assert!(BackingStore::create(&path).is_err());
    }

    #[test]
    fn extend_and_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = fresh(&dir);
        store.extend(3).unwrap();
        assert_eq!(store.total_blocks().unwrap(), 3);

        let block = [0xA5u8; PHYSICAL_BLOCK_SIZE];
        store.write_physical(2, &block).unwrap();
        assert_eq!(store.read_physical(2).unwrap(), block);
    }

    #[test]
    fn extend_never_shrinks() {
        let dir = TempDir::new().unwrap();
        let store = fresh(&dir);
        store.extend(5).unwrap();
        store.extend(2).unwrap();
        assert_eq!(store.total_blocks().unwrap(), 5);
    }

    #[test]
    fn read_past_end_is_short() {
        let dir = TempDir::new().unwrap();
        let store = fresh(&dir);
        store.extend(1).unwrap();
        let err = store.read_physical(1).unwrap_err();
        assert!(matches!(err, FsError::ShortRead { block: 1, .. }));
    }

    #[test]
    fn open_rejects_ragged_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.coffer");
        BackingStore::create(&path).unwrap();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len((HEADER_SIZE + 100) as u64).unwrap();
        assert!(matches!(
            BackingStore::open(&path, false),
            Err(FsError::InvalidHeader(_))
        ));
    }
}
