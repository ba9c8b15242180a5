use thiserror::Error;

use crate::BlockId;

pub type FsResult<T> = Result<T, FsError>;

/// Every failure the filesystem can surface. The operation layer hands the
/// bridge `-err.errno()`; everything below passes these through unchanged.
#[derive(Debug, Error)]
pub enum FsError {
    /// AEAD tag mismatch: the block was tampered with, relocated, or the
    /// key is wrong.
    #[error("block {0} failed authentication")]
    CorruptBlock(BlockId),

    #[error("short read at block {block}: got {got} of {want} bytes")]
    ShortRead { block: BlockId, got: usize, want: usize },

    #[error("short write at block {block}: wrote {got} of {want} bytes")]
    ShortWrite { block: BlockId, got: usize, want: usize },

    /// The 64-bit block address space is exhausted.
    #[error("no space left on volume")]
    NoSpace,

    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("file exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file name too long")]
    NameTooLong,

    #[error("invalid argument")]
    InvalidArgument,

    /// Extended attribute lookups that miss get their own kind so the
    /// bridge can answer ENODATA instead of ENOENT.
    #[error("no such extended attribute")]
    NoAttr,

    #[error("volume is mounted read-only")]
    ReadOnly,

    #[error("operation not supported")]
    Unsupported,

    /// Corruption was detected in the allocator bitmaps or the root
    /// header; the volume refuses all further work until remounted.
    #[error("volume poisoned by earlier corruption")]
    Poisoned,

    #[error("passphrase does not unlock this volume")]
    BadPassphrase,

    #[error("invalid volume header: {0}")]
    InvalidHeader(String),

    #[error("unknown mount option: {0}")]
    UnknownOption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// POSIX errno for this error. The bridge negates it.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::CorruptBlock(_) => libc::EIO,
            FsError::ShortRead { .. } | FsError::ShortWrite { .. } => libc::EIO,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NoAttr => libc::ENODATA,
            FsError::ReadOnly => libc::EROFS,
            FsError::Unsupported => libc::ENOSYS,
            FsError::Poisoned => libc::EIO,
            FsError::BadPassphrase => libc::EACCES,
            FsError::InvalidHeader(_) => libc::EIO,
            FsError::UnknownOption(_) => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::CorruptBlock(7).errno(), libc::EIO);
        assert_eq!(FsError::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::NoAttr.errno(), libc::ENODATA);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> FsResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert_eq!(fails().unwrap_err().errno(), libc::EIO);
    }
}
