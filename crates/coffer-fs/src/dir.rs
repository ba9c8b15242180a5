//! Directory encoding: a packed array of fixed-size entries in the
//! directory file's content.
//!
//! Each entry is `name[256] (NUL-padded) || child header id (8, LE)`.
//! Entries keep insertion order; removal swaps the last entry into the
//! gap and truncates.

use coffer_blocks::{BlockStore, BLOCK_ID_SIZE};
use coffer_core::{BlockId, FsError, FsResult};

use crate::file;
use crate::layout::FileKind;
use crate::FILENAME_SIZE;

pub const DIR_ENTRY_SIZE: usize = FILENAME_SIZE + BLOCK_ID_SIZE;

/// Reject names the on-disk format cannot hold: empty, overlong, or
/// containing NUL or `/`.
pub fn validate_name(name: &[u8]) -> FsResult<()> {
    if name.is_empty() || name == b"." || name == b".." {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > FILENAME_SIZE {
        return Err(FsError::NameTooLong);
    }
    if name.contains(&0) || name.contains(&b'/') {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

fn dir_size(store: &mut BlockStore, dir: BlockId) -> FsResult<u64> {
    let header = file::read_header(store, dir)?;
    if header.kind != FileKind::Directory {
        return Err(FsError::NotADirectory);
    }
    if header.size % DIR_ENTRY_SIZE as u64 != 0 {
        return Err(FsError::CorruptBlock(dir));
    }
    Ok(header.size)
}

fn decode_entry(raw: &[u8]) -> (Vec<u8>, BlockId) {
    let name_end = raw[..FILENAME_SIZE]
        .iter()
        .rposition(|&b| b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    let mut id = [0u8; BLOCK_ID_SIZE];
    id.copy_from_slice(&raw[FILENAME_SIZE..DIR_ENTRY_SIZE]);
    (raw[..name_end].to_vec(), u64::from_le_bytes(id))
}

fn encode_entry(name: &[u8], child: BlockId) -> [u8; DIR_ENTRY_SIZE] {
    let mut raw = [0u8; DIR_ENTRY_SIZE];
    raw[..name.len()].copy_from_slice(name);
    raw[FILENAME_SIZE..].copy_from_slice(&child.to_le_bytes());
    raw
}

pub fn entry_count(store: &mut BlockStore, dir: BlockId) -> FsResult<u64> {
    Ok(dir_size(store, dir)? / DIR_ENTRY_SIZE as u64)
}

pub fn is_empty(store: &mut BlockStore, dir: BlockId) -> FsResult<bool> {
    Ok(dir_size(store, dir)? == 0)
}

pub fn list(store: &mut BlockStore, dir: BlockId) -> FsResult<Vec<(Vec<u8>, BlockId)>> {
    let size = dir_size(store, dir)?;
    let data = file::read_bytes(store, dir, 0, size as usize)?;
    Ok(data.chunks_exact(DIR_ENTRY_SIZE).map(decode_entry).collect())
}

/// Find `name`, returning its entry index and child id.
pub fn lookup(
    store: &mut BlockStore,
    dir: BlockId,
    name: &[u8],
) -> FsResult<Option<(u64, BlockId)>> {
    let size = dir_size(store, dir)?;
    let data = file::read_bytes(store, dir, 0, size as usize)?;
    for (i, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
        let (entry_name, child) = decode_entry(raw);
        if entry_name == name {
            return Ok(Some((i as u64, child)));
        }
    }
    Ok(None)
}

pub fn insert(store: &mut BlockStore, dir: BlockId, name: &[u8], child: BlockId) -> FsResult<()> {
    validate_name(name)?;
    if lookup(store, dir, name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }
    let size = dir_size(store, dir)?;
    file::write_bytes(store, dir, size, &encode_entry(name, child))
}

/// Point an existing entry at a different child (rename plumbing).
pub fn set_child(store: &mut BlockStore, dir: BlockId, index: u64, child: BlockId) -> FsResult<()> {
    let offset = index * DIR_ENTRY_SIZE as u64 + FILENAME_SIZE as u64;
    file::write_bytes(store, dir, offset, &child.to_le_bytes())
}

/// Remove `name`, returning the child id it pointed at.
pub fn remove(store: &mut BlockStore, dir: BlockId, name: &[u8]) -> FsResult<BlockId> {
    let (index, child) = lookup(store, dir, name)?.ok_or(FsError::NotFound)?;
    let size = dir_size(store, dir)?;
    let count = size / DIR_ENTRY_SIZE as u64;
    let last = count - 1;
    if index != last {
        let tail = file::read_bytes(
            store,
            dir,
            last * DIR_ENTRY_SIZE as u64,
            DIR_ENTRY_SIZE,
        )?;
        file::write_bytes(store, dir, index * DIR_ENTRY_SIZE as u64, &tail)?;
    }
    file::truncate_file(store, dir, last * DIR_ENTRY_SIZE as u64)?;
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_blocks::BackingStore;
    use coffer_crypto::KeyMaterial;
    use tempfile::TempDir;

    fn fresh(dir: &TempDir) -> (BlockStore, BlockId) {
        let backing = BackingStore::create(&dir.path().join("vol.coffer")).unwrap();
        let mut store = BlockStore::new(backing, &KeyMaterial::from_bytes([1u8; 32]), 32);
        store.format().unwrap();
        let d = file::create_file(&mut store, FileKind::Directory).unwrap();
        (store, d)
    }

    #[test]
    fn insert_lookup_list() {
        let tmp = TempDir::new().unwrap();
        let (mut store, d) = fresh(&tmp);

        insert(&mut store, d, b"alpha", 10).unwrap();
        insert(&mut store, d, b"beta", 11).unwrap();
        insert(&mut store, d, b"gamma", 12).unwrap();

        assert_eq!(lookup(&mut store, d, b"beta").unwrap(), Some((1, 11)));
        assert_eq!(lookup(&mut store, d, b"delta").unwrap(), None);

        let names: Vec<Vec<u8>> = list(&mut store, d).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    }

    #[test]
    fn duplicate_insert_fails() {
        let tmp = TempDir::new().unwrap();
        let (mut store, d) = fresh(&tmp);

        insert(&mut store, d, b"x", 10).unwrap();
        assert!(matches!(
            insert(&mut store, d, b"x", 11),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn remove_swaps_last_entry_in() {
        let tmp = TempDir::new().unwrap();
        let (mut store, d) = fresh(&tmp);

        insert(&mut store, d, b"a", 10).unwrap();
        insert(&mut store, d, b"b", 11).unwrap();
        insert(&mut store, d, b"c", 12).unwrap();

        assert_eq!(remove(&mut store, d, b"a").unwrap(), 10);
        let entries = list(&mut store, d).unwrap();
        assert_eq!(
            entries,
            vec![(b"c".to_vec(), 12), (b"b".to_vec(), 11)],
            "last entry must take the removed slot"
        );

        assert_eq!(remove(&mut store, d, b"b").unwrap(), 11);
        assert_eq!(remove(&mut store, d, b"c").unwrap(), 12);
        assert!(is_empty(&mut store, d).unwrap());
    }

    #[test]
    fn remove_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let (mut store, d) = fresh(&tmp);
        assert!(matches!(
            remove(&mut store, d, b"ghost"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn names_up_to_filename_size_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let (mut store, d) = fresh(&tmp);

        let long = vec![b'n'; FILENAME_SIZE];
        insert(&mut store, d, &long, 42).unwrap();
        assert_eq!(lookup(&mut store, d, &long).unwrap(), Some((0, 42)));

        let too_long = vec![b'n'; FILENAME_SIZE + 1];
        assert!(matches!(
            insert(&mut store, d, &too_long, 43),
            Err(FsError::NameTooLong)
        ));
    }

    #[test]
    fn bad_names_rejected() {
        assert!(matches!(validate_name(b""), Err(FsError::InvalidArgument)));
        assert!(matches!(validate_name(b"."), Err(FsError::InvalidArgument)));
        assert!(matches!(validate_name(b".."), Err(FsError::InvalidArgument)));
        assert!(matches!(
            validate_name(b"nul\0byte"),
            Err(FsError::InvalidArgument)
        ));
        assert!(matches!(
            validate_name(b"a/b"),
            Err(FsError::InvalidArgument)
        ));
        assert!(validate_name(b"ordinary-name.txt").is_ok());
    }

    #[test]
    fn not_a_directory() {
        let tmp = TempDir::new().unwrap();
        let (mut store, _) = fresh(&tmp);
        let f = file::create_file(&mut store, FileKind::Regular).unwrap();
        assert!(matches!(
            list(&mut store, f),
            Err(FsError::NotADirectory)
        ));
    }
}
