//! Opaque integer handles for cached resources.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Marker for compiled kernels.
#[derive(Debug)]
pub enum KernelResource {}

/// Marker for shared memory buffers.
#[derive(Debug)]
pub enum BufferResource {}

/// Handle to a compiled kernel.
pub type KernelHandle = Handle<KernelResource>;

/// Handle to an allocated buffer.
pub type BufferHandle = Handle<BufferResource>;

/// Integer identifying a cached resource.
///
/// A handle is valid if and only if its value is strictly positive. The
/// resource marker keeps kernel and buffer handles from being mixed up;
/// it carries no data.
pub struct Handle<R> {
    raw: i64,
    _resource: PhantomData<fn() -> R>,
}

impl<R> Handle<R> {
    /// The value returned in place of a handle when nothing was created.
    pub const INVALID: Self = Self::from_raw(0);

    /// Wrap a raw integer. No cache lookup takes place.
    pub const fn from_raw(raw: i64) -> Self {
        Self {
            raw,
            _resource: PhantomData,
        }
    }

    /// The raw integer value.
    pub fn raw(self) -> i64 {
        self.raw
    }

    /// Whether the handle could refer to a resource at all.
    pub fn is_valid(self) -> bool {
        self.raw > 0
    }

    /// Zero-based slot index in the cache sequence.
    pub(crate) fn index(self) -> Option<usize> {
        if self.is_valid() {
            usize::try_from(self.raw - 1).ok()
        } else {
            None
        }
    }
}

impl<R> Clone for Handle<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Handle<R> {}

impl<R> PartialEq for Handle<R> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<R> Eq for Handle<R> {}

impl<R> PartialOrd for Handle<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R> Ord for Handle<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<R> Hash for Handle<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<R> Default for Handle<R> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<R> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.raw)
    }
}

impl<R> fmt::Display for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl<R> From<Handle<R>> for i64 {
    fn from(handle: Handle<R>) -> Self {
        handle.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_follows_sign() {
        for raw in -10_000i64..=100_000 {
            let handle = BufferHandle::from_raw(raw);
            assert_eq!(handle.is_valid(), raw > 0, "handle {}", raw);
        }
    }

    #[test]
    fn test_extremes() {
        assert!(KernelHandle::from_raw(i64::MAX).is_valid());
        assert!(!KernelHandle::from_raw(i64::MIN).is_valid());
        assert!(!KernelHandle::INVALID.is_valid());
        assert_eq!(KernelHandle::default(), KernelHandle::INVALID);
    }

    #[test]
    fn test_index_is_one_based() {
        assert_eq!(BufferHandle::from_raw(1).index(), Some(0));
        assert_eq!(BufferHandle::from_raw(42).index(), Some(41));
        assert_eq!(BufferHandle::from_raw(0).index(), None);
        assert_eq!(BufferHandle::from_raw(-3).index(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(KernelHandle::from_raw(7).to_string(), "7");
        assert_eq!(format!("{:?}", BufferHandle::from_raw(-1)), "Handle(-1)");
    }
}
