//! Persistence boundary for configuration blobs.
//!
//! The engine only sees whole blobs: a write either lands completely or the
//! previous blob is kept. Implementations live outside this crate
//! (`tankalarm-db` provides the file-backed one).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};

/// The blobs the server persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKey {
    Config,
    Heartbeat,
}

impl BlobKey {
    /// Stable storage name of the blob.
    pub fn name(self) -> &'static str {
        match self {
            Self::Config => "server_config.json",
            Self::Heartbeat => "server_heartbeat.json",
        }
    }
}

/// Atomic whole-blob storage.
pub trait BlobStore: Send + Sync {
    /// Read a blob. `Ok(None)` means it was never written.
    fn read(&self, key: BlobKey) -> CoreResult<Option<Vec<u8>>>;

    /// Replace a blob atomically.
    fn write(&self, key: BlobKey, bytes: &[u8]) -> CoreResult<()>;
}

/// In-memory blob storage with switchable write failures, for tests and
/// ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobKey, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed a blob directly, bypassing the failure switch.
    pub fn insert(&self, key: BlobKey, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(key, bytes.into());
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, key: BlobKey) -> CoreResult<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| CoreError::Persistence("blob map poisoned".into()))?;
        Ok(blobs.get(&key).cloned())
    }

    fn write(&self, key: BlobKey, bytes: &[u8]) -> CoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::Persistence(format!("write of {} failed", key.name())));
        }
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| CoreError::Persistence("blob map poisoned".into()))?;
        blobs.insert(key, bytes.to_vec());
        Ok(())
    }
}

impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    fn read(&self, key: BlobKey) -> CoreResult<Option<Vec<u8>>> {
        (**self).read(key)
    }

    fn write(&self, key: BlobKey, bytes: &[u8]) -> CoreResult<()> {
        (**self).write(key, bytes)
    }
}
