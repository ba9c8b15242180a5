//! coffer-fs: the filesystem on top of the encrypted block layer
//!
//! Files are chains of header blocks: a file header holds the mode, the
//! size, 32 direct data-block pointers and the inline xattr area;
//! continuation blocks extend the pointer array 32 slots at a time and
//! are doubly linked. Directories are regular chains whose content is a
//! packed entry array; extended attributes spill from the inline area
//! into an overflow chain.
//!
//! The operation surface (`Volume`) resolves paths against the root
//! directory and exposes the POSIX-shaped vtable a kernel bridge drives.
//! One coarse lock serializes operations; every result is a typed error
//! the bridge turns into a negated errno.

pub mod check;
pub mod dir;
pub mod file;
pub mod layout;
pub mod ops;
pub mod path;
pub mod volume;
pub mod xattr;

pub use layout::FileKind;
pub use ops::{Attr, DirEntry, OpContext, StatFs, VolumeOps, RENAME_EXCHANGE, RENAME_NOREPLACE};
pub use volume::Volume;
pub use xattr::{XATTR_CREATE, XATTR_REPLACE};

pub use coffer_core::{BlockId, FsError, FsResult, MountOptions};

/// Maximum length of one path component, in bytes.
pub const FILENAME_SIZE: usize = 256;

/// Logical index of the root directory header: the first block after
/// superblock 0, always allocated.
pub const ROOT_ID: BlockId = 1;
