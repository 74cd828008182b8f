//! Deduplication cache for delivered notifications
//!
//! Records the fingerprint of every message that reached the notification
//! sink so that repeated triggers for the same OOM kill stay silent.
//! Backed by an embedded sled database, either in a throw-away temporary
//! directory (the default, destroyed on [`DedupCache::close`]) or at a
//! persistent path that survives restarts.

mod fingerprint;

pub use fingerprint::Fingerprint;

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::CacheError;

/// Name of the tree holding delivered fingerprints
const SENT_TREE: &str = "notifications_sent";

/// Value stored against each fingerprint
const SENTINEL: &[u8] = b"sent";

/// Where the cache keeps its data
#[derive(Debug, Clone, Default)]
pub enum CacheLocation {
    /// Fresh temporary directory, removed on close
    #[default]
    Ephemeral,
    /// Directory kept across restarts
    Persistent(PathBuf),
}

struct CacheStore {
    db: sled::Db,
    tree: sled::Tree,
    path: PathBuf,
    // Dropped after the db so the directory outlives the open files
    temp_dir: Option<TempDir>,
}

/// Persistent set of delivered-message fingerprints
pub struct DedupCache {
    location: CacheLocation,
    store: RwLock<Option<CacheStore>>,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl DedupCache {
    pub fn new(location: CacheLocation) -> Self {
        Self {
            location,
            store: RwLock::new(None),
            #[cfg(test)]
            fail_writes: Default::default(),
        }
    }

    pub fn ephemeral() -> Self {
        Self::new(CacheLocation::Ephemeral)
    }

    /// Open the backing store. Must succeed before any other call.
    pub fn init(&self) -> Result<(), CacheError> {
        let mut guard = self.store.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(CacheError::AlreadyInitialized);
        }

        let (path, temp_dir) = match &self.location {
            CacheLocation::Ephemeral => {
                let dir = tempfile::Builder::new().prefix("oom-notifier.").tempdir()?;
                (dir.path().join("cache.db"), Some(dir))
            }
            CacheLocation::Persistent(path) => {
                std::fs::create_dir_all(path)?;
                (path.clone(), None)
            }
        };

        let db = sled::Config::new().path(&path).open()?;
        let tree = db.open_tree(SENT_TREE)?;

        info!(
            path = %path.display(),
            persistent = temp_dir.is_none(),
            entries = tree.len(),
            "Deduplication cache initialized"
        );

        *guard = Some(CacheStore {
            db,
            tree,
            path,
            temp_dir,
        });
        Ok(())
    }

    /// Whether a message with this fingerprint was already delivered
    pub fn check_if_seen(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let guard = self.store.read().unwrap_or_else(PoisonError::into_inner);
        let store = guard.as_ref().ok_or(CacheError::NotInitialized)?;

        Ok(seen_or_fail_open(
            fingerprint,
            store.tree.contains_key(fingerprint.as_bytes()),
        ))
    }

    /// Record a delivered message. Marking twice is a no-op.
    pub fn mark_seen(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        let guard = self.store.read().unwrap_or_else(PoisonError::into_inner);
        let store = guard.as_ref().ok_or(CacheError::NotInitialized)?;
        self.check_writable()?;

        store.tree.insert(fingerprint.as_bytes(), SENTINEL)?;
        Ok(())
    }

    /// Atomically mark a fingerprint, returning whether it was already present
    pub fn test_and_mark_seen(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let guard = self.store.read().unwrap_or_else(PoisonError::into_inner);
        let store = guard.as_ref().ok_or(CacheError::NotInitialized)?;
        self.check_writable()?;

        let swapped =
            store
                .tree
                .compare_and_swap(fingerprint.as_bytes(), None::<&[u8]>, Some(SENTINEL))?;
        Ok(swapped.is_err())
    }

    /// Make every later write fail with a store error
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), CacheError> {
        #[cfg(test)]
        {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CacheError::Store(sled::Error::Unsupported(
                    "writes disabled".to_string(),
                )));
            }
        }
        Ok(())
    }

    /// Number of delivered fingerprints
    pub fn len(&self) -> Result<usize, CacheError> {
        let guard = self.store.read().unwrap_or_else(PoisonError::into_inner);
        let store = guard.as_ref().ok_or(CacheError::NotInitialized)?;
        Ok(store.tree.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Path of the open store, if initialized
    pub fn path(&self) -> Option<PathBuf> {
        let guard = self.store.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(|store| store.path.clone())
    }

    /// Release the backing store. An ephemeral store is deleted from disk.
    /// Closing an uninitialized cache does nothing.
    pub fn close(&self) -> Result<(), CacheError> {
        let store = {
            let mut guard = self.store.write().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };

        let Some(CacheStore {
            db,
            tree,
            path,
            temp_dir,
        }) = store
        else {
            return Ok(());
        };

        if let Err(e) = db.flush() {
            warn!(error = %e, "Failed to flush deduplication cache");
        }
        drop(tree);
        drop(db);

        if let Some(dir) = temp_dir {
            dir.close()?;
            debug!(path = %path.display(), "Removed ephemeral deduplication cache");
        }

        info!(path = %path.display(), "Deduplication cache closed");
        Ok(())
    }
}

/// Read failures count as "not seen": a duplicate alert is preferable to a
/// silently dropped one
fn seen_or_fail_open(fingerprint: &Fingerprint, read: sled::Result<bool>) -> bool {
    match read {
        Ok(seen) => seen,
        Err(e) => {
            warn!(fingerprint = %fingerprint, error = %e, "Cache read failed, treating as not seen");
            false
        }
    }
}

impl Drop for DedupCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close deduplication cache");
        }
    }
}

#[cfg(test)]
mod tests;
