//! Extended attributes.
//!
//! Attributes are a packed stream of `(name_len: u8, name,
//! value_len: u16 LE, value)` entries. The first 256 bytes live inline in
//! the file header; the remainder spills into a chain of overflow blocks,
//! each `next_id (8, LE) || payload`. A zero `name_len` terminates the
//! stream when space remains.

use std::collections::HashSet;

use coffer_blocks::{BlockStore, BLOCK_ID_SIZE, LOGICAL_BLOCK_SIZE};
use coffer_core::{BlockId, FsError, FsResult};

use crate::file;
use crate::layout::XATTR_INLINE_SIZE;

/// Fail if the attribute already exists.
pub const XATTR_CREATE: u32 = 1;
/// Fail if the attribute does not exist.
pub const XATTR_REPLACE: u32 = 2;

const OVERFLOW_PAYLOAD: usize = LOGICAL_BLOCK_SIZE - BLOCK_ID_SIZE;

pub fn get(store: &mut BlockStore, file_id: BlockId, name: &[u8]) -> FsResult<Vec<u8>> {
    let entries = load_entries(store, file_id)?;
    entries
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
        .ok_or(FsError::NoAttr)
}

pub fn list(store: &mut BlockStore, file_id: BlockId) -> FsResult<Vec<Vec<u8>>> {
    Ok(load_entries(store, file_id)?
        .into_iter()
        .map(|(n, _)| n)
        .collect())
}

pub fn set(
    store: &mut BlockStore,
    file_id: BlockId,
    name: &[u8],
    value: &[u8],
    flags: u32,
) -> FsResult<()> {
    validate(name, value)?;
    let mut entries = load_entries(store, file_id)?;
    let existing = entries.iter().position(|(n, _)| n == name);
    match existing {
        Some(_) if flags & XATTR_CREATE != 0 => return Err(FsError::AlreadyExists),
        None if flags & XATTR_REPLACE != 0 => return Err(FsError::NoAttr),
        Some(at) => entries[at].1 = value.to_vec(),
        None => entries.push((name.to_vec(), value.to_vec())),
    }
    store_entries(store, file_id, &entries)
}

pub fn remove(store: &mut BlockStore, file_id: BlockId, name: &[u8]) -> FsResult<()> {
    let mut entries = load_entries(store, file_id)?;
    let at = entries
        .iter()
        .position(|(n, _)| n == name)
        .ok_or(FsError::NoAttr)?;
    entries.remove(at);
    store_entries(store, file_id, &entries)
}

/// Next pointer of an overflow block.
pub(crate) fn next_overflow(store: &mut BlockStore, id: BlockId) -> FsResult<BlockId> {
    let page = store.page(id)?;
    let mut next = [0u8; BLOCK_ID_SIZE];
    next.copy_from_slice(&page[..BLOCK_ID_SIZE]);
    Ok(u64::from_le_bytes(next))
}

fn validate(name: &[u8], value: &[u8]) -> FsResult<()> {
    if name.is_empty() || name.len() > u8::MAX as usize || name.contains(&0) {
        return Err(FsError::InvalidArgument);
    }
    if value.len() > u16::MAX as usize {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

fn load_entries(store: &mut BlockStore, file_id: BlockId) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let header = file::read_header(store, file_id)?;
    let mut buf = header.xattr_inline.to_vec();

    let mut visited = HashSet::from([file_id]);
    let mut cur = header.xattr_overflow;
    while cur != 0 {
        if !visited.insert(cur) {
            return Err(FsError::CorruptBlock(cur));
        }
        let page = store.page(cur)?;
        let mut next = [0u8; BLOCK_ID_SIZE];
        next.copy_from_slice(&page[..BLOCK_ID_SIZE]);
        buf.extend_from_slice(&page[BLOCK_ID_SIZE..]);
        cur = u64::from_le_bytes(next);
    }
    parse(file_id, &buf)
}

fn parse(block: BlockId, buf: &[u8]) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries = Vec::new();
    let mut at = 0;
    while at < buf.len() {
        let name_len = buf[at] as usize;
        if name_len == 0 {
            break;
        }
        at += 1;
        if at + name_len + 2 > buf.len() {
            return Err(FsError::CorruptBlock(block));
        }
        let name = buf[at..at + name_len].to_vec();
        at += name_len;
        let value_len = u16::from_le_bytes([buf[at], buf[at + 1]]) as usize;
        at += 2;
        if at + value_len > buf.len() {
            return Err(FsError::CorruptBlock(block));
        }
        entries.push((name, buf[at..at + value_len].to_vec()));
        at += value_len;
    }
    Ok(entries)
}

fn store_entries(
    store: &mut BlockStore,
    file_id: BlockId,
    entries: &[(Vec<u8>, Vec<u8>)],
) -> FsResult<()> {
    let mut header = file::read_header(store, file_id)?;

    let mut buf = Vec::new();
    for (name, value) in entries {
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
        buf.extend_from_slice(value);
    }

    let mut old_chain = Vec::new();
    let mut visited = HashSet::from([file_id]);
    let mut cur = header.xattr_overflow;
    while cur != 0 {
        if !visited.insert(cur) {
            return Err(FsError::CorruptBlock(cur));
        }
        old_chain.push(cur);
        cur = next_overflow(store, cur)?;
    }

    let inline_len = buf.len().min(XATTR_INLINE_SIZE);
    header.xattr_inline = [0u8; XATTR_INLINE_SIZE];
    header.xattr_inline[..inline_len].copy_from_slice(&buf[..inline_len]);

    let spill = &buf[inline_len..];
    let chunks: Vec<&[u8]> = spill.chunks(OVERFLOW_PAYLOAD).collect();

    // Reuse the existing chain blocks in order, allocate the shortfall,
    // free the surplus.
    let mut chain = Vec::with_capacity(chunks.len());
    for i in 0..chunks.len() {
        match old_chain.get(i) {
            Some(&id) => chain.push(id),
            None => chain.push(store.allocate()?),
        }
    }
    for &surplus in old_chain.iter().skip(chunks.len()) {
        store.free(surplus)?;
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let next = chain.get(i + 1).copied().unwrap_or(0);
        let page = store.fresh_page_mut(chain[i])?;
        page[..BLOCK_ID_SIZE].copy_from_slice(&next.to_le_bytes());
        page[BLOCK_ID_SIZE..BLOCK_ID_SIZE + chunk.len()].copy_from_slice(chunk);
    }

    header.xattr_overflow = chain.first().copied().unwrap_or(0);
    file::write_header(store, file_id, &header)
}
