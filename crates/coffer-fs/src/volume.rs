//! Volume lifecycle: create, open, close.
//!
//! A `Volume` is the single per-process object for one backing file.
//! One coarse mutex serializes every operation; the cache is flushed on
//! close and best-effort on drop. Corruption detected in the allocator
//! bitmaps or the root header poisons the volume: every later operation
//! fails until it is reopened.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rand::RngCore;
use secrecy::SecretString;
use tracing::{info, warn};

use coffer_blocks::{BackingStore, BlockStore, VolumeHeader};
use coffer_core::{BlockId, FsError, FsResult, MountOptions};
use coffer_crypto::{
    derive_kek, derive_subkey, generate_key, unwrap_key, wrap_key, KdfParams,
    BLOCK_KEY_DOMAIN, SALT_SIZE, WRAPPED_KEY_SIZE,
};

use crate::layout::FileKind;
use crate::{file, ROOT_ID};

#[derive(Debug)]
pub struct Volume {
    pub(crate) inner: Mutex<VolumeInner>,
}

#[derive(Debug)]
pub(crate) struct VolumeInner {
    pub(crate) store: BlockStore,
    pub(crate) read_only: bool,
    pub(crate) allow_other: bool,
    pub(crate) poisoned: bool,
    pub(crate) handles: HashMap<u64, Handle>,
    pub(crate) next_fh: u64,
}

#[derive(Debug)]
pub(crate) struct Handle {
    pub(crate) file: BlockId,
    pub(crate) kind: FileKind,
    /// Set when the file is unlinked while the handle is open; every
    /// later operation through the handle fails.
    pub(crate) stale: bool,
}

impl Volume {
    /// Create a fresh volume at `path` with the default KDF cost.
    pub fn create(path: &Path, opts: MountOptions) -> FsResult<Self> {
        Self::create_with_params(path, opts, KdfParams::default())
    }

    pub fn create_with_params(
        path: &Path,
        opts: MountOptions,
        kdf: KdfParams,
    ) -> FsResult<Self> {
        let passphrase = required_passphrase(&opts)?;

        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let kek = derive_kek(passphrase, &salt, &kdf).map_err(|_| FsError::InvalidArgument)?;
        let volume_key = generate_key();
        let wrapped = wrap_key(&kek, &volume_key).map_err(crypto_failure)?;
        let mut wrapped_key = [0u8; WRAPPED_KEY_SIZE];
        wrapped_key.copy_from_slice(&wrapped);
        let block_key = derive_subkey(&volume_key, BLOCK_KEY_DOMAIN).map_err(crypto_failure)?;

        let backing = BackingStore::create(path)?;
        backing.write_header(&VolumeHeader::new(kdf, salt, wrapped_key).encode())?;

        let mut store = BlockStore::new(backing, &block_key, opts.cache_capacity);
        store.format()?;
        let root = file::create_file(&mut store, FileKind::Directory)?;
        if root != ROOT_ID {
            return Err(FsError::InvalidHeader(format!(
                "root header landed at block {root}"
            )));
        }
        store.flush()?;

        info!(path = %path.display(), "volume created");
        Ok(Self::from_store(store, &opts))
    }

    /// Open an existing volume, deriving and unwrapping the key material
    /// and verifying the root directory.
    pub fn open(path: &Path, opts: MountOptions) -> FsResult<Self> {
        let passphrase = required_passphrase(&opts)?;

        let backing = BackingStore::open(path, opts.read_only)?;
        let header = VolumeHeader::decode(&backing.read_header()?)?;

        let kek = derive_kek(passphrase, &header.salt, &header.kdf)
            .map_err(|_| FsError::InvalidArgument)?;
        let volume_key =
            unwrap_key(&kek, &header.wrapped_key).map_err(|_| FsError::BadPassphrase)?;
        let block_key = derive_subkey(&volume_key, BLOCK_KEY_DOMAIN).map_err(crypto_failure)?;

        let mut store = BlockStore::new(backing, &block_key, opts.cache_capacity);

        // The root header is load-bearing for every path walk; refuse to
        // mount when it does not check out.
        if !store.is_allocated(ROOT_ID)? {
            return Err(FsError::CorruptBlock(ROOT_ID));
        }
        let root = file::read_header(&mut store, ROOT_ID)?;
        if root.kind != FileKind::Directory {
            return Err(FsError::CorruptBlock(ROOT_ID));
        }

        info!(path = %path.display(), read_only = opts.read_only, "volume opened");
        Ok(Self::from_store(store, &opts))
    }

    fn from_store(store: BlockStore, opts: &MountOptions) -> Self {
        Self {
            inner: Mutex::new(VolumeInner {
                store,
                read_only: opts.read_only,
                allow_other: opts.allow_other,
                poisoned: false,
                handles: HashMap::new(),
                next_fh: 1,
            }),
        }
    }

    /// Flush and close. Also happens best-effort on drop.
    pub fn close(self) -> FsResult<()> {
        let mut inner = lock(&self.inner);
        inner.store.flush()
    }

    pub fn is_poisoned(&self) -> bool {
        lock(&self.inner).poisoned
    }

    pub fn allow_other(&self) -> bool {
        lock(&self.inner).allow_other
    }

    /// Run one operation under the volume lock, with the poisoned-volume
    /// gate on entry and critical-corruption detection on exit.
    pub(crate) fn with_inner<T>(
        &self,
        op: impl FnOnce(&mut VolumeInner) -> FsResult<T>,
    ) -> FsResult<T> {
        let mut inner = lock(&self.inner);
        if inner.poisoned {
            return Err(FsError::Poisoned);
        }
        let result = op(&mut inner);
        if let Err(FsError::CorruptBlock(block)) = &result {
            if BlockStore::is_critical(*block, ROOT_ID) {
                warn!(block, "critical corruption, poisoning volume");
                inner.poisoned = true;
            }
        }
        result
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        if let Err(err) = inner.store.flush() {
            warn!(%err, "flush on drop failed");
        }
    }
}

impl VolumeInner {
    pub(crate) fn ensure_writable(&self) -> FsResult<()> {
        if self.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Invalidate every open handle of an unlinked file. There is no
    /// hidden-file grace period: the blocks are gone now.
    pub(crate) fn invalidate_handles(&mut self, file: BlockId) {
        for handle in self.handles.values_mut() {
            if handle.file == file {
                handle.stale = true;
            }
        }
    }
}

fn required_passphrase(opts: &MountOptions) -> FsResult<&SecretString> {
    opts.passphrase.as_ref().ok_or(FsError::InvalidArgument)
}

fn crypto_failure(err: anyhow::Error) -> FsError {
    FsError::Io(std::io::Error::other(err.to_string()))
}

fn lock(mutex: &Mutex<VolumeInner>) -> std::sync::MutexGuard<'_, VolumeInner> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
