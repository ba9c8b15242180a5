//! File primitives over header chains.
//!
//! Offset `o` lives in slot `o / LOGICAL_BLOCK_SIZE`. Slots 0..32 are the
//! header's direct array, each further group of 32 is one continuation.
//! A slot id of 0 is a hole and reads as zeros; continuations missing at
//! the tail of the chain mean every slot past them is a hole too.
//!
//! Chain walks track visited blocks and fail with `CorruptBlock` on a
//! revisit, so adversarial storage cannot loop a traversal.

use std::collections::HashSet;

use coffer_blocks::{BlockStore, LOGICAL_BLOCK_SIZE};
use coffer_core::{BlockId, FsError, FsResult};

use crate::layout::{Continuation, FileHeader, FileKind, DIRECT_SLOTS};
use crate::xattr;

const LBS: u64 = LOGICAL_BLOCK_SIZE as u64;
const SLOTS_PER_GROUP: u64 = DIRECT_SLOTS as u64;

pub fn create_file(store: &mut BlockStore, kind: FileKind) -> FsResult<BlockId> {
    let id = store.allocate()?;
    FileHeader::new(kind).encode_into(store.fresh_page_mut(id)?);
    Ok(id)
}

pub fn read_header(store: &mut BlockStore, id: BlockId) -> FsResult<FileHeader> {
    FileHeader::decode(id, store.page(id)?)
}

pub fn write_header(store: &mut BlockStore, id: BlockId, header: &FileHeader) -> FsResult<()> {
    header.encode_into(store.page_mut(id)?);
    Ok(())
}

fn read_continuation(store: &mut BlockStore, id: BlockId) -> FsResult<Continuation> {
    Ok(Continuation::decode(store.page(id)?))
}

fn write_continuation(store: &mut BlockStore, id: BlockId, cont: &Continuation) -> FsResult<()> {
    cont.encode_into(store.page_mut(id)?);
    Ok(())
}

/// Read up to `len` bytes at `offset`, clamped to the file size. Reading
/// at or past the end returns an empty buffer.
pub fn read_bytes(
    store: &mut BlockStore,
    header_id: BlockId,
    offset: u64,
    len: usize,
) -> FsResult<Vec<u8>> {
    let header = read_header(store, header_id)?;
    if offset >= header.size || len == 0 {
        return Ok(Vec::new());
    }
    let len = (len as u64).min(header.size - offset);
    let end = offset + len;
    let mut out = Vec::with_capacity(len as usize);

    let first_slot = offset / LBS;
    let last_slot = (end - 1) / LBS;

    let mut visited = HashSet::from([header_id]);
    let mut group_idx: u64 = 0;
    let mut direct = header.direct;
    let mut next = header.next;
    let mut chain_ended = false;

    for slot in first_slot..=last_slot {
        while slot / SLOTS_PER_GROUP > group_idx {
            group_idx += 1;
            if chain_ended || next == 0 {
                chain_ended = true;
                continue;
            }
            if !visited.insert(next) {
                return Err(FsError::CorruptBlock(next));
            }
            let cont = read_continuation(store, next)?;
            direct = cont.direct;
            next = cont.next;
        }
        let slot_start = slot * LBS;
        let a = (offset.max(slot_start) - slot_start) as usize;
        let b = (end.min(slot_start + LBS) - slot_start) as usize;
        let bid = if chain_ended {
            0
        } else {
            direct[(slot % SLOTS_PER_GROUP) as usize]
        };
        if bid == 0 {
            out.resize(out.len() + (b - a), 0);
        } else {
            out.extend_from_slice(&store.page(bid)?[a..b]);
        }
    }
    Ok(out)
}

/// Write `data` at `offset`, allocating data blocks and continuations on
/// demand and growing `file_size` when the write extends past it. The
/// write is complete once the header block is dirty in the cache.
pub fn write_bytes(
    store: &mut BlockStore,
    header_id: BlockId,
    offset: u64,
    data: &[u8],
) -> FsResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    let mut header = read_header(store, header_id)?;
    let end = offset
        .checked_add(data.len() as u64)
        .ok_or(FsError::InvalidArgument)?;
    let first_slot = offset / LBS;
    let last_slot = (end - 1) / LBS;
    let last_group = last_slot / SLOTS_PER_GROUP;

    let mut visited = HashSet::from([header_id]);
    let mut group_idx: u64 = 0;
    let mut group_block = header_id;
    let mut is_header = true;
    let mut cont = Continuation::new(0);
    let mut written = 0usize;

    loop {
        let group_first = group_idx * SLOTS_PER_GROUP;
        let mut group_dirty = false;
        if first_slot <= group_first + SLOTS_PER_GROUP - 1 && last_slot >= group_first {
            let lo = first_slot.max(group_first);
            let hi = last_slot.min(group_first + SLOTS_PER_GROUP - 1);
            for slot in lo..=hi {
                let idx = (slot % SLOTS_PER_GROUP) as usize;
                let mut bid = if is_header {
                    header.direct[idx]
                } else {
                    cont.direct[idx]
                };
                let fresh = bid == 0;
                if fresh {
                    bid = store.allocate()?;
                    if is_header {
                        header.direct[idx] = bid;
                    } else {
                        cont.direct[idx] = bid;
                    }
                    group_dirty = true;
                }
                let slot_start = slot * LBS;
                let a = (offset.max(slot_start) - slot_start) as usize;
                let b = (end.min(slot_start + LBS) - slot_start) as usize;
                let page = if fresh {
                    store.fresh_page_mut(bid)?
                } else {
                    store.page_mut(bid)?
                };
                page[a..b].copy_from_slice(&data[written..written + (b - a)]);
                written += b - a;
            }
        }
        if !is_header && group_dirty {
            write_continuation(store, group_block, &cont)?;
        }
        if group_idx == last_group {
            break;
        }

        let mut next_id = if is_header { header.next } else { cont.next };
        if next_id == 0 {
            let cid = store.allocate()?;
            Continuation::new(group_block).encode_into(store.fresh_page_mut(cid)?);
            if is_header {
                header.next = cid;
            } else {
                cont.next = cid;
                write_continuation(store, group_block, &cont)?;
            }
            next_id = cid;
        }
        if !visited.insert(next_id) {
            return Err(FsError::CorruptBlock(next_id));
        }
        cont = read_continuation(store, next_id)?;
        group_block = next_id;
        is_header = false;
        group_idx += 1;
    }

    if end > header.size {
        header.size = end;
    }
    write_header(store, header_id, &header)
}

/// Shrink or grow a file to `new_size`. Shrinking frees every slot past
/// the boundary and zeroes the tail of the last retained block; growing
/// just moves the size, leaving the new range as holes.
pub fn truncate_file(store: &mut BlockStore, header_id: BlockId, new_size: u64) -> FsResult<()> {
    let mut header = read_header(store, header_id)?;
    if new_size >= header.size {
        if new_size != header.size {
            header.size = new_size;
            write_header(store, header_id, &header)?;
        }
        return Ok(());
    }

    let keep_slots = new_size.div_ceil(LBS);

    // Stale bytes past the new end must not resurface if the file regrows.
    if new_size % LBS != 0 {
        if let Some(bid) = slot_block(store, header_id, &header, keep_slots - 1)? {
            let from = (new_size % LBS) as usize;
            store.page_mut(bid)?[from..].fill(0);
        }
    }

    for (idx, slot_id) in header.direct.iter_mut().enumerate() {
        if (idx as u64) >= keep_slots && *slot_id != 0 {
            store.free(*slot_id)?;
            *slot_id = 0;
        }
    }

    let mut visited = HashSet::from([header_id]);
    let mut chain: Vec<(BlockId, Continuation)> = Vec::new();
    let mut cur = header.next;
    while cur != 0 {
        if !visited.insert(cur) {
            return Err(FsError::CorruptBlock(cur));
        }
        let cont = read_continuation(store, cur)?;
        let next = cont.next;
        chain.push((cur, cont));
        cur = next;
    }

    for (pos, (_, cont)) in chain.iter_mut().enumerate() {
        let group = pos as u64 + 1;
        for (idx, slot_id) in cont.direct.iter_mut().enumerate() {
            let slot = group * SLOTS_PER_GROUP + idx as u64;
            if slot >= keep_slots && *slot_id != 0 {
                store.free(*slot_id)?;
                *slot_id = 0;
            }
        }
    }

    // A continuation whose whole 32-slot range is past the end is unlinked.
    let retained = chain
        .iter()
        .enumerate()
        .take_while(|(pos, _)| ((*pos as u64 + 1) * SLOTS_PER_GROUP) < keep_slots)
        .count();
    for (cid, _) in &chain[retained..] {
        store.free(*cid)?;
    }
    if retained == 0 {
        header.next = 0;
    } else {
        chain[retained - 1].1.next = 0;
    }
    for (cid, cont) in &chain[..retained] {
        write_continuation(store, *cid, cont)?;
    }

    header.size = new_size;
    write_header(store, header_id, &header)
}

/// Every block owned by a file, grouped by role.
pub struct FileBlocks {
    pub continuations: Vec<BlockId>,
    /// (slot index, block id) for each allocated data slot.
    pub data: Vec<(u64, BlockId)>,
    pub xattr: Vec<BlockId>,
}

pub fn collect_blocks(store: &mut BlockStore, header_id: BlockId) -> FsResult<FileBlocks> {
    let header = read_header(store, header_id)?;
    let mut visited = HashSet::from([header_id]);
    let mut blocks = FileBlocks {
        continuations: Vec::new(),
        data: Vec::new(),
        xattr: Vec::new(),
    };

    for (idx, &bid) in header.direct.iter().enumerate() {
        if bid != 0 {
            blocks.data.push((idx as u64, bid));
        }
    }
    let mut group: u64 = 1;
    let mut cur = header.next;
    while cur != 0 {
        if !visited.insert(cur) {
            return Err(FsError::CorruptBlock(cur));
        }
        let cont = read_continuation(store, cur)?;
        blocks.continuations.push(cur);
        for (idx, &bid) in cont.direct.iter().enumerate() {
            if bid != 0 {
                blocks.data.push((group * SLOTS_PER_GROUP + idx as u64, bid));
            }
        }
        cur = cont.next;
        group += 1;
    }

    let mut cur = header.xattr_overflow;
    while cur != 0 {
        if !visited.insert(cur) {
            return Err(FsError::CorruptBlock(cur));
        }
        blocks.xattr.push(cur);
        cur = xattr::next_overflow(store, cur)?;
    }
    Ok(blocks)
}

/// Free every block of a file: data slots, continuations, xattr overflow
/// and finally the header itself.
pub fn delete_file(store: &mut BlockStore, header_id: BlockId) -> FsResult<()> {
    let blocks = collect_blocks(store, header_id)?;
    for (_, bid) in blocks.data {
        store.free(bid)?;
    }
    for bid in blocks.continuations {
        store.free(bid)?;
    }
    for bid in blocks.xattr {
        store.free(bid)?;
    }
    store.free(header_id)
}

/// Number of blocks a file occupies, header included.
pub fn allocated_blocks(store: &mut BlockStore, header_id: BlockId) -> FsResult<u64> {
    let blocks = collect_blocks(store, header_id)?;
    Ok(1 + (blocks.continuations.len() + blocks.data.len() + blocks.xattr.len()) as u64)
}

/// Block holding `slot`, or `None` for a hole.
fn slot_block(
    store: &mut BlockStore,
    header_id: BlockId,
    header: &FileHeader,
    slot: u64,
) -> FsResult<Option<BlockId>> {
    let group = slot / SLOTS_PER_GROUP;
    let idx = (slot % SLOTS_PER_GROUP) as usize;
    if group == 0 {
        return Ok(nonzero(header.direct[idx]));
    }
    let mut visited = HashSet::from([header_id]);
    let mut cur = header.next;
    for _ in 1..group {
        if cur == 0 {
            return Ok(None);
        }
        if !visited.insert(cur) {
            return Err(FsError::CorruptBlock(cur));
        }
        cur = read_continuation(store, cur)?.next;
    }
    if cur == 0 {
        return Ok(None);
    }
    if !visited.insert(cur) {
        return Err(FsError::CorruptBlock(cur));
    }
    Ok(nonzero(read_continuation(store, cur)?.direct[idx]))
}

fn nonzero(id: BlockId) -> Option<BlockId> {
    if id == 0 {
        None
    } else {
        Some(id)
    }
}
