pub mod error;
pub mod options;

pub use error::{FsError, FsResult};
pub use options::MountOptions;

/// Logical index of a block inside the volume. Block 0 is the first
/// superblock; the root directory header always lives at block 1.
pub type BlockId = u64;
