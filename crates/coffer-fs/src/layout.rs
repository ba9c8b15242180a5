//! On-disk layout of file header and continuation blocks.
//!
//! File header payload:
//! ```text
//! mode                 1   0 = regular, 1 = directory, 2 = symlink
//! file_size            8   LE
//! next_continuation    8   0 = none
//! direct[32]         256   data block ids, 0 = hole
//! xattr_overflow       8   0 = none
//! xattr_inline       256
//! (reserved)           *   unused, zero
//! ```
//!
//! Continuation payload:
//! ```text
//! next_continuation    8   0 = none
//! prev_continuation    8   header id for the first continuation
//! direct[32]         256
//! (reserved)           *
//! ```

use coffer_blocks::{BLOCK_ID_SIZE, LOGICAL_BLOCK_SIZE};
use coffer_core::{BlockId, FsError, FsResult};

/// Direct data-block pointers per header or continuation block.
pub const DIRECT_SLOTS: usize = 32;

/// Bytes of the inline extended-attribute area in the file header.
pub const XATTR_INLINE_SIZE: usize = 256;

const MODE_END: usize = 1;
const SIZE_END: usize = MODE_END + 8;
const NEXT_END: usize = SIZE_END + BLOCK_ID_SIZE;
const DIRECT_END: usize = NEXT_END + DIRECT_SLOTS * BLOCK_ID_SIZE;
const XATTR_ID_END: usize = DIRECT_END + BLOCK_ID_SIZE;
const XATTR_INLINE_END: usize = XATTR_ID_END + XATTR_INLINE_SIZE;

/// Total bytes of the file header structure within its block.
pub const FILE_HEADER_SIZE: usize = XATTR_INLINE_END;

const CONT_NEXT_END: usize = BLOCK_ID_SIZE;
const CONT_PREV_END: usize = CONT_NEXT_END + BLOCK_ID_SIZE;
const CONT_DIRECT_END: usize = CONT_PREV_END + DIRECT_SLOTS * BLOCK_ID_SIZE;

/// Total bytes of the continuation structure within its block.
pub const CONTINUATION_SIZE: usize = CONT_DIRECT_END;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
}

impl FileKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(FileKind::Regular),
            1 => Some(FileKind::Directory),
            2 => Some(FileKind::Symlink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub kind: FileKind,
    pub size: u64,
    /// First continuation block, 0 = none.
    pub next: BlockId,
    pub direct: [BlockId; DIRECT_SLOTS],
    /// First xattr overflow block, 0 = none.
    pub xattr_overflow: BlockId,
    pub xattr_inline: [u8; XATTR_INLINE_SIZE],
}

impl FileHeader {
    pub fn new(kind: FileKind) -> Self {
        Self {
            kind,
            size: 0,
            next: 0,
            direct: [0; DIRECT_SLOTS],
            xattr_overflow: 0,
            xattr_inline: [0; XATTR_INLINE_SIZE],
        }
    }

    /// Decode the header stored in `page`. `block` is only used to name
    /// the block in the corruption error.
    pub fn decode(block: BlockId, page: &[u8; LOGICAL_BLOCK_SIZE]) -> FsResult<Self> {
        let kind = FileKind::from_byte(page[0]).ok_or(FsError::CorruptBlock(block))?;
        let size = read_u64(page, MODE_END);
        let next = read_u64(page, SIZE_END);
        let direct = read_ids(page, NEXT_END);
        let xattr_overflow = read_u64(page, DIRECT_END);
        let mut xattr_inline = [0u8; XATTR_INLINE_SIZE];
        xattr_inline.copy_from_slice(&page[XATTR_ID_END..XATTR_INLINE_END]);
        Ok(Self {
            kind,
            size,
            next,
            direct,
            xattr_overflow,
            xattr_inline,
        })
    }

    pub fn encode_into(&self, page: &mut [u8; LOGICAL_BLOCK_SIZE]) {
        page[0] = self.kind as u8;
        write_u64(page, MODE_END, self.size);
        write_u64(page, SIZE_END, self.next);
        write_ids(page, NEXT_END, &self.direct);
        write_u64(page, DIRECT_END, self.xattr_overflow);
        page[XATTR_ID_END..XATTR_INLINE_END].copy_from_slice(&self.xattr_inline);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub next: BlockId,
    pub prev: BlockId,
    pub direct: [BlockId; DIRECT_SLOTS],
}

impl Continuation {
    pub fn new(prev: BlockId) -> Self {
        Self {
            next: 0,
            prev,
            direct: [0; DIRECT_SLOTS],
        }
    }

    pub fn decode(page: &[u8; LOGICAL_BLOCK_SIZE]) -> Self {
        Self {
            next: read_u64(page, 0),
            prev: read_u64(page, CONT_NEXT_END),
            direct: read_ids(page, CONT_PREV_END),
        }
    }

    pub fn encode_into(&self, page: &mut [u8; LOGICAL_BLOCK_SIZE]) {
        write_u64(page, 0, self.next);
        write_u64(page, CONT_NEXT_END, self.prev);
        write_ids(page, CONT_PREV_END, &self.direct);
    }
}

fn read_u64(page: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&page[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn write_u64(page: &mut [u8], at: usize, value: u64) {
    page[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_ids(page: &[u8], at: usize) -> [BlockId; DIRECT_SLOTS] {
    let mut ids = [0u64; DIRECT_SLOTS];
    for (i, id) in ids.iter_mut().enumerate() {
        *id = read_u64(page, at + i * BLOCK_ID_SIZE);
    }
    ids
}

fn write_ids(page: &mut [u8], at: usize, ids: &[BlockId; DIRECT_SLOTS]) {
    for (i, id) in ids.iter().enumerate() {
        write_u64(page, at + i * BLOCK_ID_SIZE, *id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut header = FileHeader::new(FileKind::Directory);
        header.size = 1234;
        header.next = 77;
        header.direct[0] = 5;
        header.direct[31] = 99;
        header.xattr_overflow = 42;
        header.xattr_inline[0] = 3;

        let mut page = Box::new([0u8; LOGICAL_BLOCK_SIZE]);
        header.encode_into(&mut page);
        assert_eq!(FileHeader::decode(1, &page).unwrap(), header);
    }

    #[test]
    fn continuation_roundtrip() {
        let mut cont = Continuation::new(9);
        cont.next = 11;
        cont.direct[7] = 1000;

        let mut page = Box::new([0u8; LOGICAL_BLOCK_SIZE]);
        cont.encode_into(&mut page);
        assert_eq!(Continuation::decode(&page), cont);
    }

    #[test]
    fn bad_mode_byte_is_corruption() {
        let mut page = Box::new([0u8; LOGICAL_BLOCK_SIZE]);
        page[0] = 9;
        assert!(matches!(
            FileHeader::decode(4, &page),
            Err(FsError::CorruptBlock(4))
        ));
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(FILE_HEADER_SIZE, 537);
        assert_eq!(CONTINUATION_SIZE, 272);
        assert!(FILE_HEADER_SIZE < LOGICAL_BLOCK_SIZE);
    }
}
