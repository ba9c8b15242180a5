//! Path resolution against the root directory.

use coffer_blocks::BlockStore;
use coffer_core::{BlockId, FsError, FsResult};

use crate::layout::FileKind;
use crate::{dir, file, FILENAME_SIZE, ROOT_ID};

/// Split a path into validated components. Empty path and `/` resolve to
/// no components (the root); repeated separators are tolerated.
pub fn components(path: &str) -> FsResult<Vec<&[u8]>> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        if part.is_empty() {
            continue;
        }
        let bytes = part.as_bytes();
        if bytes.len() > FILENAME_SIZE {
            return Err(FsError::NameTooLong);
        }
        if bytes.contains(&0) || part == "." || part == ".." {
            return Err(FsError::InvalidArgument);
        }
        parts.push(bytes);
    }
    Ok(parts)
}

/// Walk `path` from the root, returning the header id it names.
pub fn resolve(store: &mut BlockStore, path: &str) -> FsResult<BlockId> {
    let mut current = ROOT_ID;
    for name in components(path)? {
        let header = file::read_header(store, current)?;
        if header.kind != FileKind::Directory {
            return Err(FsError::NotADirectory);
        }
        current = dir::lookup(store, current, name)?
            .map(|(_, child)| child)
            .ok_or(FsError::NotFound)?;
    }
    Ok(current)
}

/// Resolve everything but the final component: the parent directory id
/// and the leaf name. The root has no parent.
pub fn resolve_parent<'p>(store: &mut BlockStore, path: &'p str) -> FsResult<(BlockId, &'p [u8])> {
    let parts = components(path)?;
    let (leaf, ancestors) = parts.split_last().ok_or(FsError::InvalidArgument)?;
    let mut current = ROOT_ID;
    for name in ancestors {
        let header = file::read_header(store, current)?;
        if header.kind != FileKind::Directory {
            return Err(FsError::NotADirectory);
        }
        current = dir::lookup(store, current, name)?
            .map(|(_, child)| child)
            .ok_or(FsError::NotFound)?;
    }
    // the parent itself must be a directory
    let header = file::read_header(store, current)?;
    if header.kind != FileKind::Directory {
        return Err(FsError::NotADirectory);
    }
    Ok((current, leaf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_normalizes() {
        assert!(components("/").unwrap().is_empty());
        assert!(components("").unwrap().is_empty());
        assert_eq!(components("/a/b").unwrap(), vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(components("a//b/").unwrap(), vec![&b"a"[..], &b"b"[..]]);
    }

    #[test]
    fn rejects_bad_components() {
        assert!(matches!(components("/a/../b"), Err(FsError::InvalidArgument)));
        assert!(matches!(components("/."), Err(FsError::InvalidArgument)));
        let long = format!("/{}", "x".repeat(FILENAME_SIZE + 1));
        assert!(matches!(components(&long), Err(FsError::NameTooLong)));
    }
}
