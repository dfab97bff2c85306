//! Append-only resource cache handing out integer handles.
//!
//! Slot `handle - 1` holds the resource. Slots are only ever appended or
//! cleared in place, so a handle keeps pointing at the same slot for the
//! lifetime of the cache and is never issued twice.

use crate::handle::Handle;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Failures reported by [`ResourceCache`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("invalid handle {0}")]
    InvalidHandle(i64),

    #[error("handle {handle} is out of range (cache holds {len} entries)")]
    OutOfRange { handle: i64, len: usize },

    #[error("handle {0} refers to a removed resource")]
    Removed(i64),

    #[error("cache is full ({limit} entries)")]
    Exhausted { limit: usize },
}

/// Thread-safe store mapping handles to shared resources.
pub struct ResourceCache<R, T> {
    entries: RwLock<Vec<Option<Arc<T>>>>,
    limit: Option<usize>,
    _resource: std::marker::PhantomData<fn() -> R>,
}

impl<R, T> ResourceCache<R, T> {
    /// Create an unbounded cache.
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Create a cache that refuses to grow past `limit` entries.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            limit,
            _resource: std::marker::PhantomData,
        }
    }

    /// Append a resource and return its handle.
    ///
    /// The N-th successful store across all threads receives handle N.
    pub fn store(&self, resource: T) -> Result<Handle<R>, CacheError> {
        let mut entries = self.entries.write();

        let limit = self
            .limit
            .unwrap_or(usize::MAX)
            .min(i64::MAX as usize);
        if entries.len() >= limit {
            return Err(CacheError::Exhausted { limit });
        }

        entries.push(Some(Arc::new(resource)));
        Ok(Handle::from_raw(entries.len() as i64))
    }

    /// Look up the resource behind `handle`.
    pub fn retrieve(&self, handle: Handle<R>) -> Result<Arc<T>, CacheError> {
        let entries = self.entries.read();
        let index = Self::slot(handle, entries.len())?;

        entries[index]
            .as_ref()
            .map(Arc::clone)
            .ok_or(CacheError::Removed(handle.raw()))
    }

    /// Clear the slot behind `handle`. Later handles keep their numbers.
    pub fn remove(&self, handle: Handle<R>) -> Result<Arc<T>, CacheError> {
        let mut entries = self.entries.write();
        let index = Self::slot(handle, entries.len())?;

        entries[index]
            .take()
            .ok_or(CacheError::Removed(handle.raw()))
    }

    /// Number of slots ever issued, removed ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no handle has been issued yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots still holding a resource.
    pub fn live(&self) -> usize {
        self.entries.read().iter().filter(|e| e.is_some()).count()
    }

    fn slot(handle: Handle<R>, len: usize) -> Result<usize, CacheError> {
        let index = handle
            .index()
            .ok_or(CacheError::InvalidHandle(handle.raw()))?;

        if index >= len {
            return Err(CacheError::OutOfRange {
                handle: handle.raw(),
                len,
            });
        }

        Ok(index)
    }
}

impl<R, T> Default for ResourceCache<R, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, T> fmt::Debug for ResourceCache<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("len", &self.len())
            .field("limit", &self.limit)
            .finish()
    }
}
