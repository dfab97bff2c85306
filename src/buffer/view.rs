//! Typed views over a shared memory block.
//!
//! A view never owns or copies memory. Access goes through guards that
//! hold the block's lock, so the device cannot write the block while a
//! guard is alive. Every slice handed out has a fixed length: nothing can
//! grow a view past the block it aliases.
//!
//! Drop guards before dispatching a kernel that binds the same buffer. A
//! dispatch waits for them only up to `Config::buffer_lock_timeout`.

use super::Element;
use crate::handle::BufferHandle;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

/// Byte-level access to a shared block.
pub(crate) trait BlockAccess: Send + Sync {
    fn read_bytes(&self) -> MappedRwLockReadGuard<'_, [u8]>;
    fn write_bytes(&self) -> MappedRwLockWriteGuard<'_, [u8]>;
}

fn read_typed<T: Element>(block: &dyn BlockAccess, count: usize) -> MappedRwLockReadGuard<'_, [T]> {
    MappedRwLockReadGuard::map(block.read_bytes(), |bytes| {
        bytemuck::cast_slice(&bytes[..count * size_of::<T>()])
    })
}

fn write_typed<T: Element>(
    block: &dyn BlockAccess,
    count: usize,
) -> MappedRwLockWriteGuard<'_, [T]> {
    MappedRwLockWriteGuard::map(block.write_bytes(), |bytes| {
        bytemuck::cast_slice_mut(&mut bytes[..count * size_of::<T>()])
    })
}

/// Split `flat` into `parts` equal, contiguous sub-slices.
fn fold<T>(flat: &[T], parts: usize) -> Vec<&[T]> {
    flat.chunks_exact(flat.len() / parts).collect()
}

fn fold_mut<T>(flat: &mut [T], parts: usize) -> Vec<&mut [T]> {
    let size = flat.len() / parts;
    flat.chunks_exact_mut(size).collect()
}

/// Group `items` into `parts` equal runs, preserving order.
fn fold_nested<S>(items: Vec<S>, parts: usize) -> Vec<Vec<S>> {
    let size = items.len() / parts;
    let mut iter = items.into_iter();
    (0..parts)
        .map(|_| iter.by_ref().take(size).collect())
        .collect()
}

/// Flat view of a one-dimensional buffer.
pub struct View1<T> {
    handle: BufferHandle,
    block: Arc<dyn BlockAccess>,
    len: usize,
    _elem: PhantomData<fn() -> T>,
}

impl<T: Element> View1<T> {
    pub(crate) fn new(handle: BufferHandle, block: Arc<dyn BlockAccess>, len: usize) -> Self {
        Self {
            handle,
            block,
            len,
            _elem: PhantomData,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn shape(&self) -> [usize; 1] {
        [self.len]
    }

    pub fn read(&self) -> MappedRwLockReadGuard<'_, [T]> {
        read_typed(&*self.block, self.len)
    }

    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [T]> {
        write_typed(&*self.block, self.len)
    }

    /// Copy the current contents out.
    pub fn to_vec(&self) -> Vec<T> {
        self.read().to_vec()
    }
}

/// Rows-of-columns view of a two-dimensional buffer.
pub struct View2<T> {
    handle: BufferHandle,
    block: Arc<dyn BlockAccess>,
    rows: usize,
    cols: usize,
    _elem: PhantomData<fn() -> T>,
}

impl<T: Element> View2<T> {
    pub(crate) fn new(
        handle: BufferHandle,
        block: Arc<dyn BlockAccess>,
        rows: usize,
        cols: usize,
    ) -> Self {
        Self {
            handle,
            block,
            rows,
            cols,
            _elem: PhantomData,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Number of elements across all rows.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn read(&self) -> Rows<'_, T> {
        Rows {
            data: read_typed(&*self.block, self.len()),
            rows: self.rows,
            cols: self.cols,
        }
    }

    pub fn write(&self) -> RowsMut<'_, T> {
        RowsMut {
            data: write_typed(&*self.block, self.len()),
            rows: self.rows,
            cols: self.cols,
        }
    }
}

/// Read guard over a [`View2`]; `rows[i]` is row `i`.
pub struct Rows<'a, T> {
    data: MappedRwLockReadGuard<'a, [T]>,
    rows: usize,
    cols: usize,
}

impl<'a, T> Rows<'a, T> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_flat(&self) -> &[T] {
        &self.data
    }

    /// One sub-slice per row, all aliasing the block.
    pub fn nested(&self) -> Vec<&[T]> {
        fold(&*self.data, self.rows)
    }
}

impl<'a, T> Index<usize> for Rows<'a, T> {
    type Output = [T];

    fn index(&self, row: usize) -> &[T] {
        assert!(row < self.rows, "row {} out of range ({} rows)", row, self.rows);
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

/// Write guard over a [`View2`].
pub struct RowsMut<'a, T> {
    data: MappedRwLockWriteGuard<'a, [T]>,
    rows: usize,
    cols: usize,
}

impl<'a, T> RowsMut<'a, T> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_flat(&self) -> &[T] {
        &self.data
    }

    pub fn as_flat_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn nested(&self) -> Vec<&[T]> {
        fold(&*self.data, self.rows)
    }

    pub fn nested_mut(&mut self) -> Vec<&mut [T]> {
        fold_mut(&mut *self.data, self.rows)
    }
}

impl<'a, T> Index<usize> for RowsMut<'a, T> {
    type Output = [T];

    fn index(&self, row: usize) -> &[T] {
        assert!(row < self.rows, "row {} out of range ({} rows)", row, self.rows);
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

impl<'a, T> IndexMut<usize> for RowsMut<'a, T> {
    fn index_mut(&mut self, row: usize) -> &mut [T] {
        assert!(row < self.rows, "row {} out of range ({} rows)", row, self.rows);
        let cols = self.cols;
        &mut self.data[row * cols..(row + 1) * cols]
    }
}

/// Three-level view of a three-dimensional buffer.
pub struct View3<T> {
    handle: BufferHandle,
    block: Arc<dyn BlockAccess>,
    dims: [usize; 3],
    _elem: PhantomData<fn() -> T>,
}

impl<T: Element> View3<T> {
    pub(crate) fn new(handle: BufferHandle, block: Arc<dyn BlockAccess>, dims: [usize; 3]) -> Self {
        Self {
            handle,
            block,
            dims,
            _elem: PhantomData,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> [usize; 3] {
        self.dims
    }

    pub fn read(&self) -> Planes<'_, T> {
        Planes {
            data: read_typed(&*self.block, self.len()),
            dims: self.dims,
        }
    }

    pub fn write(&self) -> PlanesMut<'_, T> {
        PlanesMut {
            data: write_typed(&*self.block, self.len()),
            dims: self.dims,
        }
    }
}

fn row_range(dims: [usize; 3], i: usize, j: usize) -> std::ops::Range<usize> {
    assert!(
        i < dims[0] && j < dims[1],
        "index ({}, {}) out of range for {}x{}x{}",
        i,
        j,
        dims[0],
        dims[1],
        dims[2]
    );
    let start = (i * dims[1] + j) * dims[2];
    start..start + dims[2]
}

/// Read guard over a [`View3`]; `planes[(i, j)]` is the innermost row.
pub struct Planes<'a, T> {
    data: MappedRwLockReadGuard<'a, [T]>,
    dims: [usize; 3],
}

impl<'a, T> Planes<'a, T> {
    pub fn shape(&self) -> [usize; 3] {
        self.dims
    }

    pub fn as_flat(&self) -> &[T] {
        &self.data
    }

    /// `dims[0]` groups of `dims[1]` rows of `dims[2]` elements.
    pub fn nested(&self) -> Vec<Vec<&[T]>> {
        let [l, w, _] = self.dims;
        fold_nested(fold(&*self.data, l * w), l)
    }
}

impl<'a, T> Index<(usize, usize)> for Planes<'a, T> {
    type Output = [T];

    fn index(&self, (i, j): (usize, usize)) -> &[T] {
        &self.data[row_range(self.dims, i, j)]
    }
}

impl<'a, T> Index<(usize, usize, usize)> for Planes<'a, T> {
    type Output = T;

    fn index(&self, (i, j, k): (usize, usize, usize)) -> &T {
        &self[(i, j)][k]
    }
}

/// Write guard over a [`View3`].
pub struct PlanesMut<'a, T> {
    data: MappedRwLockWriteGuard<'a, [T]>,
    dims: [usize; 3],
}

impl<'a, T> PlanesMut<'a, T> {
    pub fn shape(&self) -> [usize; 3] {
        self.dims
    }

    pub fn as_flat(&self) -> &[T] {
        &self.data
    }

    pub fn as_flat_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn nested(&self) -> Vec<Vec<&[T]>> {
        let [l, w, _] = self.dims;
        fold_nested(fold(&*self.data, l * w), l)
    }

    pub fn nested_mut(&mut self) -> Vec<Vec<&mut [T]>> {
        let [l, w, _] = self.dims;
        fold_nested(fold_mut(&mut *self.data, l * w), l)
    }
}

impl<'a, T> Index<(usize, usize)> for PlanesMut<'a, T> {
    type Output = [T];

    fn index(&self, (i, j): (usize, usize)) -> &[T] {
        &self.data[row_range(self.dims, i, j)]
    }
}

impl<'a, T> IndexMut<(usize, usize)> for PlanesMut<'a, T> {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut [T] {
        let range = row_range(self.dims, i, j);
        &mut self.data[range]
    }
}

impl<'a, T> Index<(usize, usize, usize)> for PlanesMut<'a, T> {
    type Output = T;

    fn index(&self, (i, j, k): (usize, usize, usize)) -> &T {
        &self[(i, j)][k]
    }
}

impl<'a, T> IndexMut<(usize, usize, usize)> for PlanesMut<'a, T> {
    fn index_mut(&mut self, (i, j, k): (usize, usize, usize)) -> &mut T {
        &mut self[(i, j)][k]
    }
}

macro_rules! impl_view_common {
    ($view:ident) => {
        impl<T> Clone for $view<T> {
            fn clone(&self) -> Self {
                Self {
                    block: Arc::clone(&self.block),
                    ..*self
                }
            }
        }

        impl<T> fmt::Debug for $view<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($view))
                    .field("handle", &self.handle)
                    .field("element", &std::any::type_name::<T>())
                    .finish()
            }
        }
    };
}

impl_view_common!(View1);
impl_view_common!(View2);
impl_view_common!(View3);

macro_rules! impl_guard_debug {
    ($guard:ident, $($field:ident),+) => {
        impl<T> fmt::Debug for $guard<'_, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($guard))
                    $(.field(stringify!($field), &self.$field))+
                    .finish()
            }
        }
    };
}

impl_guard_debug!(Rows, rows, cols);
impl_guard_debug!(RowsMut, rows, cols);
impl_guard_debug!(Planes, dims);
impl_guard_debug!(PlanesMut, dims);
