//! The operation surface a kernel bridge drives.
//!
//! Every method resolves paths itself, holds the volume lock for its
//! whole duration, and returns a typed error whose `errno()` the bridge
//! negates. Attributes are synthesised: the on-disk format stores only
//! the file type, so permissions come back as 0777 and ownership as the
//! calling context's uid/gid.

use tracing::debug;

use coffer_blocks::LOGICAL_BLOCK_SIZE;
use coffer_core::{BlockId, FsError, FsResult};

use crate::layout::FileKind;
use crate::volume::{Handle, Volume, VolumeInner};
use crate::{dir, file, path, xattr, FILENAME_SIZE};

/// Fail `rename` when the destination exists.
pub const RENAME_NOREPLACE: u32 = 1;
/// Atomically swap source and destination entries.
pub const RENAME_EXCHANGE: u32 = 2;

/// Read-only snapshot of the caller, captured at operation entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub umask: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub kind: FileKind,
    /// `st_mode`: type bits plus synthesised 0777 permissions.
    pub mode: u32,
    pub size: u64,
    /// Blocks the file occupies, header and continuations included.
    pub blocks: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub name_max: u32,
}

/// The §6.2 operation surface, implemented for `Volume`.
///
/// Split out as a trait (rather than inherent methods) so this vtable's
/// `open`/`create` can coexist with `Volume`'s own lifecycle
/// constructors of the same name.
pub trait VolumeOps {
    fn init(&self) -> FsResult<()>;
    fn destroy(&self) -> FsResult<()>;
    fn getattr(&self, ctx: &OpContext, path_str: &str) -> FsResult<Attr>;
    fn lookup(&self, ctx: &OpContext, parent: &str, name: &str) -> FsResult<Attr>;
    fn readlink(&self, path_str: &str) -> FsResult<Vec<u8>>;
    fn mknod(&self, path_str: &str, mode: u32) -> FsResult<()>;
    fn mkdir(&self, path_str: &str) -> FsResult<()>;
    fn unlink(&self, path_str: &str) -> FsResult<()>;
    fn rmdir(&self, path_str: &str) -> FsResult<()>;
    fn symlink(&self, target: &str, path_str: &str) -> FsResult<()>;
    fn rename(&self, src: &str, dst: &str, flags: u32) -> FsResult<()>;
    fn chmod(&self, path: &str, mode: u32) -> FsResult<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()>;
    fn truncate(&self, path_str: &str, size: u64) -> FsResult<()>;
    fn open(&self, path_str: &str, flags: i32) -> FsResult<u64>;
    fn read(&self, fh: u64, offset: u64, len: usize) -> FsResult<Vec<u8>>;
    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize>;
    fn statfs(&self) -> FsResult<StatFs>;
    fn flush(&self, fh: u64) -> FsResult<()>;
    fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()>;
    fn release(&self, fh: u64) -> FsResult<()>;
    fn setxattr(&self, path_str: &str, name: &[u8], value: &[u8], flags: u32) -> FsResult<()>;
    fn getxattr(&self, path_str: &str, name: &[u8]) -> FsResult<Vec<u8>>;
    fn listxattr(&self, path_str: &str) -> FsResult<Vec<Vec<u8>>>;
    fn removexattr(&self, path_str: &str, name: &[u8]) -> FsResult<()>;
    fn opendir(&self, path_str: &str) -> FsResult<u64>;
    fn readdir(&self, fh: u64) -> FsResult<Vec<DirEntry>>;
    fn releasedir(&self, fh: u64) -> FsResult<()>;
    fn create(&self, path_str: &str) -> FsResult<u64>;
}

impl VolumeOps for Volume {
    fn init(&self) -> FsResult<()> {
        debug!("volume init");
        Ok(())
    }

    /// Final flush before the bridge goes away.
    fn destroy(&self) -> FsResult<()> {
        self.with_inner(|inner| inner.store.flush())
    }

    fn getattr(&self, ctx: &OpContext, path_str: &str) -> FsResult<Attr> {
        self.with_inner(|inner| {
            let id = path::resolve(&mut inner.store, path_str)?;
            attr_of(inner, ctx, id)
        })
    }

    fn lookup(&self, ctx: &OpContext, parent: &str, name: &str) -> FsResult<Attr> {
        self.with_inner(|inner| {
            let dir_id = path::resolve(&mut inner.store, parent)?;
            let header = file::read_header(&mut inner.store, dir_id)?;
            if header.kind != FileKind::Directory {
                return Err(FsError::NotADirectory);
            }
            let (_, child) = dir::lookup(&mut inner.store, dir_id, name.as_bytes())?
                .ok_or(FsError::NotFound)?;
            attr_of(inner, ctx, child)
        })
    }

    fn readlink(&self, path_str: &str) -> FsResult<Vec<u8>> {
        self.with_inner(|inner| {
            let id = path::resolve(&mut inner.store, path_str)?;
            let header = file::read_header(&mut inner.store, id)?;
            if header.kind != FileKind::Symlink {
                return Err(FsError::InvalidArgument);
            }
            file::read_bytes(&mut inner.store, id, 0, header.size as usize)
        })
    }

    /// Regular files only; device and fifo nodes are not representable.
    fn mknod(&self, path_str: &str, mode: u32) -> FsResult<()> {
        let file_type = mode & libc::S_IFMT;
        if file_type != 0 && file_type != libc::S_IFREG {
            return Err(FsError::Unsupported);
        }
        debug!(path = path_str, "mknod");
        self.with_inner(|inner| {
            create_entry(inner, path_str, FileKind::Regular).map(|_| ())
        })
    }

    fn mkdir(&self, path_str: &str) -> FsResult<()> {
        debug!(path = path_str, "mkdir");
        self.with_inner(|inner| {
            create_entry(inner, path_str, FileKind::Directory).map(|_| ())
        })
    }

    fn unlink(&self, path_str: &str) -> FsResult<()> {
        debug!(path = path_str, "unlink");
        self.with_inner(|inner| {
            inner.ensure_writable()?;
            let (parent, name) = path::resolve_parent(&mut inner.store, path_str)?;
            let (_, child) =
                dir::lookup(&mut inner.store, parent, name)?.ok_or(FsError::NotFound)?;
            let header = file::read_header(&mut inner.store, child)?;
            if header.kind == FileKind::Directory {
                return Err(FsError::IsADirectory);
            }
            dir::remove(&mut inner.store, parent, name)?;
            file::delete_file(&mut inner.store, child)?;
            inner.invalidate_handles(child);
            Ok(())
        })
    }

    fn rmdir(&self, path_str: &str) -> FsResult<()> {
        debug!(path = path_str, "rmdir");
        self.with_inner(|inner| {
            inner.ensure_writable()?;
            let (parent, name) = path::resolve_parent(&mut inner.store, path_str)?;
            let (_, child) =
                dir::lookup(&mut inner.store, parent, name)?.ok_or(FsError::NotFound)?;
            let header = file::read_header(&mut inner.store, child)?;
            if header.kind != FileKind::Directory {
                return Err(FsError::NotADirectory);
            }
            if !dir::is_empty(&mut inner.store, child)? {
                return Err(FsError::NotEmpty);
            }
            dir::remove(&mut inner.store, parent, name)?;
            file::delete_file(&mut inner.store, child)?;
            inner.invalidate_handles(child);
            Ok(())
        })
    }

    /// A symlink is a file whose content is the target path.
    fn symlink(&self, target: &str, path_str: &str) -> FsResult<()> {
        debug!(path = path_str, target, "symlink");
        self.with_inner(|inner| {
            let id = create_entry(inner, path_str, FileKind::Symlink)?;
            file::write_bytes(&mut inner.store, id, 0, target.as_bytes())
        })
    }

    /// Atomic at the directory-entry level. `RENAME_NOREPLACE` refuses an
    /// existing destination; `RENAME_EXCHANGE` swaps the two entries. A
    /// plain replace deletes the replaced file.
    fn rename(&self, src: &str, dst: &str, flags: u32) -> FsResult<()> {
        if flags & !(RENAME_NOREPLACE | RENAME_EXCHANGE) != 0
            || flags == RENAME_NOREPLACE | RENAME_EXCHANGE
        {
            return Err(FsError::InvalidArgument);
        }
        debug!(src, dst, flags, "rename");
        self.with_inner(|inner| {
            inner.ensure_writable()?;
            let (src_parent, src_name) = path::resolve_parent(&mut inner.store, src)?;
            let src_name = src_name.to_vec();
            let (dst_parent, dst_name) = path::resolve_parent(&mut inner.store, dst)?;
            let dst_name = dst_name.to_vec();
            if src_parent == dst_parent && src_name == dst_name {
                return Ok(());
            }

            let (src_idx, src_child) = dir::lookup(&mut inner.store, src_parent, &src_name)?
                .ok_or(FsError::NotFound)?;
            let existing = dir::lookup(&mut inner.store, dst_parent, &dst_name)?;

            if flags & RENAME_EXCHANGE != 0 {
                let (dst_idx, dst_child) = existing.ok_or(FsError::NotFound)?;
                dir::set_child(&mut inner.store, src_parent, src_idx, dst_child)?;
                dir::set_child(&mut inner.store, dst_parent, dst_idx, src_child)?;
                return Ok(());
            }

            if let Some((_, dst_child)) = existing {
                if flags & RENAME_NOREPLACE != 0 {
                    return Err(FsError::AlreadyExists);
                }
                let src_kind = file::read_header(&mut inner.store, src_child)?.kind;
                let dst_kind = file::read_header(&mut inner.store, dst_child)?.kind;
                if dst_kind == FileKind::Directory {
                    if src_kind != FileKind::Directory {
                        return Err(FsError::IsADirectory);
                    }
                    if !dir::is_empty(&mut inner.store, dst_child)? {
                        return Err(FsError::NotEmpty);
                    }
                } else if src_kind == FileKind::Directory {
                    return Err(FsError::NotADirectory);
                }
                dir::remove(&mut inner.store, dst_parent, &dst_name)?;
                file::delete_file(&mut inner.store, dst_child)?;
                inner.invalidate_handles(dst_child);
            }

            dir::insert(&mut inner.store, dst_parent, &dst_name, src_child)?;
            dir::remove(&mut inner.store, src_parent, &src_name)?;
            Ok(())
        })
    }

    /// Permission bits are synthesised, never persisted.
    fn chmod(&self, _path: &str, _mode: u32) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    /// Ownership is synthesised, never persisted.
    fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn truncate(&self, path_str: &str, size: u64) -> FsResult<()> {
        debug!(path = path_str, size, "truncate");
        self.with_inner(|inner| {
            inner.ensure_writable()?;
            let id = path::resolve(&mut inner.store, path_str)?;
            let header = file::read_header(&mut inner.store, id)?;
            if header.kind == FileKind::Directory {
                return Err(FsError::IsADirectory);
            }
            file::truncate_file(&mut inner.store, id, size)
        })
    }

    /// Open a regular file, returning the handle the read/write/flush
    /// family operates on. `O_TRUNC` empties the file first.
    fn open(&self, path_str: &str, flags: i32) -> FsResult<u64> {
        self.with_inner(|inner| {
            let id = path::resolve(&mut inner.store, path_str)?;
            let header = file::read_header(&mut inner.store, id)?;
            match header.kind {
                FileKind::Regular => {}
                FileKind::Directory => return Err(FsError::IsADirectory),
                FileKind::Symlink => return Err(FsError::InvalidArgument),
            }
            let accmode = flags & libc::O_ACCMODE;
            let writable = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;
            if writable || flags & libc::O_TRUNC != 0 {
                inner.ensure_writable()?;
            }
            if flags & libc::O_TRUNC != 0 {
                file::truncate_file(&mut inner.store, id, 0)?;
            }
            Ok(insert_handle(inner, id, FileKind::Regular))
        })
    }

    fn read(&self, fh: u64, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        self.with_inner(|inner| {
            let id = handle_file(inner, fh, FileKind::Regular)?;
            file::read_bytes(&mut inner.store, id, offset, len)
        })
    }

    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.with_inner(|inner| {
            inner.ensure_writable()?;
            let id = handle_file(inner, fh, FileKind::Regular)?;
            file::write_bytes(&mut inner.store, id, offset, data)?;
            Ok(data.len())
        })
    }

    fn statfs(&self) -> FsResult<StatFs> {
        self.with_inner(|inner| {
            Ok(StatFs {
                block_size: LOGICAL_BLOCK_SIZE as u32,
                total_blocks: inner.store.total_blocks()?,
                free_blocks: inner.store.count_free()?,
                name_max: FILENAME_SIZE as u32,
            })
        })
    }

    /// Full cache write-back; `fsync` behaves identically.
    fn flush(&self, _fh: u64) -> FsResult<()> {
        self.with_inner(|inner| inner.store.flush())
    }

    fn fsync(&self, fh: u64, _datasync: bool) -> FsResult<()> {
        self.flush(fh)
    }

    fn release(&self, fh: u64) -> FsResult<()> {
        self.with_inner(|inner| {
            inner.handles.remove(&fh);
            Ok(())
        })
    }

    fn setxattr(&self, path_str: &str, name: &[u8], value: &[u8], flags: u32) -> FsResult<()> {
        debug!(path = path_str, "setxattr");
        self.with_inner(|inner| {
            inner.ensure_writable()?;
            let id = path::resolve(&mut inner.store, path_str)?;
            xattr::set(&mut inner.store, id, name, value, flags)
        })
    }

    fn getxattr(&self, path_str: &str, name: &[u8]) -> FsResult<Vec<u8>> {
        self.with_inner(|inner| {
            let id = path::resolve(&mut inner.store, path_str)?;
            xattr::get(&mut inner.store, id, name)
        })
    }

    fn listxattr(&self, path_str: &str) -> FsResult<Vec<Vec<u8>>> {
        self.with_inner(|inner| {
            let id = path::resolve(&mut inner.store, path_str)?;
            xattr::list(&mut inner.store, id)
        })
    }

    fn removexattr(&self, path_str: &str, name: &[u8]) -> FsResult<()> {
        debug!(path = path_str, "removexattr");
        self.with_inner(|inner| {
            inner.ensure_writable()?;
            let id = path::resolve(&mut inner.store, path_str)?;
            xattr::remove(&mut inner.store, id, name)
        })
    }

    fn opendir(&self, path_str: &str) -> FsResult<u64> {
        self.with_inner(|inner| {
            let id = path::resolve(&mut inner.store, path_str)?;
            let header = file::read_header(&mut inner.store, id)?;
            if header.kind != FileKind::Directory {
                return Err(FsError::NotADirectory);
            }
            Ok(insert_handle(inner, id, FileKind::Directory))
        })
    }

    /// List a directory opened with `opendir`, `.` and `..` included.
    fn readdir(&self, fh: u64) -> FsResult<Vec<DirEntry>> {
        self.with_inner(|inner| {
            let id = handle_file(inner, fh, FileKind::Directory)?;
            let mut entries = vec![
                DirEntry {
                    name: b".".to_vec(),
                    kind: FileKind::Directory,
                },
                DirEntry {
                    name: b"..".to_vec(),
                    kind: FileKind::Directory,
                },
            ];
            for (name, child) in dir::list(&mut inner.store, id)? {
                let kind = file::read_header(&mut inner.store, child)?.kind;
                entries.push(DirEntry { name, kind });
            }
            Ok(entries)
        })
    }

    fn releasedir(&self, fh: u64) -> FsResult<()> {
        self.release(fh)
    }

    /// Create a regular file and open it in one step.
    fn create(&self, path_str: &str) -> FsResult<u64> {
        debug!(path = path_str, "create");
        self.with_inner(|inner| {
            let id = create_entry(inner, path_str, FileKind::Regular)?;
            Ok(insert_handle(inner, id, FileKind::Regular))
        })
    }
}

fn attr_of(inner: &mut VolumeInner, ctx: &OpContext, id: BlockId) -> FsResult<Attr> {
    let header = file::read_header(&mut inner.store, id)?;
    let (type_bits, nlink) = match header.kind {
        FileKind::Regular => (libc::S_IFREG, 1),
        FileKind::Symlink => (libc::S_IFLNK, 1),
        FileKind::Directory => (
            libc::S_IFDIR,
            2 + dir::entry_count(&mut inner.store, id)? as u32,
        ),
    };
    Ok(Attr {
        kind: header.kind,
        mode: type_bits | 0o777,
        size: header.size,
        blocks: file::allocated_blocks(&mut inner.store, id)?,
        nlink,
        uid: ctx.uid,
        gid: ctx.gid,
    })
}

fn create_entry(inner: &mut VolumeInner, path_str: &str, kind: FileKind) -> FsResult<BlockId> {
    inner.ensure_writable()?;
    let (parent, name) = path::resolve_parent(&mut inner.store, path_str)?;
    let name = name.to_vec();
    if dir::lookup(&mut inner.store, parent, &name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }
    let id = file::create_file(&mut inner.store, kind)?;
    if let Err(err) = dir::insert(&mut inner.store, parent, &name, id) {
        let _ = file::delete_file(&mut inner.store, id);
        return Err(err);
    }
    Ok(id)
}

fn insert_handle(inner: &mut VolumeInner, id: BlockId, kind: FileKind) -> u64 {
    let fh = inner.next_fh;
    inner.next_fh += 1;
    inner.handles.insert(
        fh,
        Handle {
            file: id,
            kind,
            stale: false,
        },
    );
    fh
}

fn handle_file(inner: &VolumeInner, fh: u64, want: FileKind) -> FsResult<BlockId> {
    let handle = inner.handles.get(&fh).ok_or(FsError::InvalidArgument)?;
    if handle.stale {
        return Err(FsError::NotFound);
    }
    if handle.kind != want {
        return Err(match want {
            FileKind::Directory => FsError::NotADirectory,
            _ => FsError::IsADirectory,
        });
    }
    Ok(handle.file)
}
