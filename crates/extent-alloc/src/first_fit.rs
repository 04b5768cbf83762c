//! First-fit extent allocator.
//!
//! This module provides [`ExtentAllocator`], a general-purpose allocator that
//! keeps every free and occupied extent in one ordered table and grows by
//! requesting blocks from an underlying system allocator.
//!
//! # Algorithm
//!
//! - **Allocation**: scans the table from the front for the first free extent
//!   that can hold the request once aligned. If none fits, a new block of at
//!   least [`GROWTH_UNIT`] bytes is requested and placed at the front of the
//!   table. The chosen extent is split at the alignment boundary and again at
//!   the requested size; each split inserts its remainder right after the
//!   piece it came from.
//! - **Deallocation**: finds the occupied extent starting at the pointer,
//!   marks it free and merges it with its previous and next table neighbors
//!   when they are free and directly adjacent in memory.
//!
//! # Table Layout
//!
//! ```text
//!           block 2 (newest)                  block 1
//!  ┌───────────────┬──────────────┐ ┌──────────┬────────┬────────────┐
//!  │ first, used   │ free         │ │ first,   │ used   │ free       │
//!  │               │              │ │ free     │        │            │
//!  └───────────────┴──────────────┘ └──────────┴────────┴────────────┘
//! ```
//!
//! The extents of one block always form a contiguous run of the table that
//! starts with the block's first extent, ordered by address.
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) where n is the number of extents
//! - **Deallocation**: O(n) where n is the number of extents
//! - **Locking**: one mutex per allocator held for the whole operation

use alloc::vec::Vec;
use core::{
    alloc::{AllocError, Allocator, Layout},
    fmt, ptr,
    ptr::NonNull,
};

use snafu::{OptionExt as _, ResultExt as _};
use spin::Mutex;

use crate::{
    error::{AllocateError, BlockLayoutSnafu, BlockRequestSnafu, ExtentTableSnafu, SizeOverflowSnafu},
    extent::Extent,
};

/// Minimum size of a block requested from the system allocator.
pub const GROWTH_UNIT: usize = 4096;

/// Alignment of every block requested from the system allocator.
pub const BLOCK_ALIGN: usize = 16;

/// Alignment to use when a caller has no specific requirement.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Extents added to the table by one allocation at most: a new block, an
/// aligned remainder and a size remainder.
const MAX_NEW_EXTENTS: usize = 3;

/// Ordered table of extents together with the allocator that backs both the
/// blocks and the table storage.
struct ExtentTable<A: Allocator> {
    extents: Vec<Extent, A>,
    growth_unit: usize,
}

unsafe impl<A> Send for ExtentTable<A> where A: Allocator + Send {}

impl<A> ExtentTable<A>
where
    A: Allocator,
{
    const fn new(alloc: A, growth_unit: usize) -> Self {
        Self {
            extents: Vec::new_in(alloc),
            growth_unit,
        }
    }

    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocateError> {
        debug_assert!(size > 0, "size must be positive");
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");

        // Reserve up front so that the inserts below cannot fail half-way.
        self.extents
            .try_reserve(MAX_NEW_EXTENTS)
            .context(ExtentTableSnafu)?;

        let found = self
            .extents
            .iter()
            .position(|extent| extent.is_free() && extent.can_fit(size, align));
        let mut index = match found {
            Some(index) => index,
            None => {
                let block = self.request_block(size, align)?;
                self.extents.insert(0, block);
                0
            }
        };

        if let Some(aligned) = self.extents[index].split_alignment(align) {
            index += 1;
            self.extents.insert(index, aligned);
        }
        if let Some(rest) = self.extents[index].split_size(size) {
            self.extents.insert(index + 1, rest);
        }

        let extent = &mut self.extents[index];
        extent.mark_occupied();
        Ok(extent.ptr())
    }

    fn request_block(&self, size: usize, align: usize) -> Result<Extent, AllocateError> {
        let block_size = size
            .checked_add(align)
            .context(SizeOverflowSnafu { size, align })?
            .max(self.growth_unit);
        let layout =
            Layout::from_size_align(block_size, BLOCK_ALIGN).context(BlockLayoutSnafu {
                size: block_size,
            })?;
        let block = self
            .extents
            .allocator()
            .allocate(layout)
            .context(BlockRequestSnafu { size: block_size })?;
        Ok(Extent::block(block.cast(), block_size))
    }

    fn release(&mut self, ptr: NonNull<u8>) {
        let Some(mut index) = self
            .extents
            .iter()
            .position(|extent| !extent.is_free() && extent.ptr() == ptr)
        else {
            return;
        };

        self.extents[index].mark_free();

        if index > 0 {
            let (before, after) = self.extents.split_at_mut(index);
            let prev = &mut before[index - 1];
            if prev.is_free() && prev.merge(&after[0]) {
                self.extents.remove(index);
                index -= 1;
            }
        }

        if index + 1 < self.extents.len() {
            let (before, after) = self.extents.split_at_mut(index + 1);
            let next = &after[0];
            if next.is_free() && before[index].merge(next) {
                self.extents.remove(index + 1);
            }
        }
    }

    /// Yields `(start, size)` for every block, from the summed sizes of each
    /// run of extents that starts with a first extent.
    fn blocks(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        let mut extents = self.extents.iter().peekable();
        core::iter::from_fn(move || {
            let first = extents.next()?;
            debug_assert!(first.is_first(), "block run must start with a first extent");
            let mut size = first.size();
            while let Some(extent) = extents.next_if(|extent| !extent.is_first()) {
                size += extent.size();
            }
            Some((first.ptr(), size))
        })
    }
}

impl<A> Drop for ExtentTable<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        let alloc = self.extents.allocator();
        for (start, size) in self.blocks() {
            if let Ok(layout) = Layout::from_size_align(size, BLOCK_ALIGN) {
                unsafe { alloc.deallocate(start, layout) };
            }
        }
    }
}

/// A thread-safe first-fit allocator over blocks obtained from `A`.
///
/// `A` is the underlying system allocator. It supplies the blocks that
/// extents are carved from and the storage of the extent table itself, so an
/// `ExtentAllocator` never allocates through the process's global allocator
/// and can be used to implement it.
///
/// # Drop
///
/// Dropping the allocator hands every block back to `A`. Any pointer still
/// obtained from [`allocate`](Self::allocate) dangles afterwards.
///
/// # Examples
///
/// ```rust
/// #![feature(allocator_api)]
///
/// use extent_alloc::ExtentAllocator;
///
/// let heap = ExtentAllocator::new();
///
/// let ptr = heap.allocate(64, 16).unwrap();
/// assert_eq!(ptr.addr().get() % 16, 0);
/// unsafe { heap.release(ptr) };
///
/// // Standard containers can allocate from it too.
/// let mut numbers = Vec::new_in(&heap);
/// numbers.extend([1, 2, 3]);
/// assert_eq!(numbers.iter().sum::<i32>(), 6);
/// ```
pub struct ExtentAllocator<A: Allocator> {
    table: Mutex<ExtentTable<A>>,
}

impl<A> ExtentAllocator<A>
where
    A: Allocator,
{
    /// Creates an allocator that requests blocks from `alloc`.
    #[must_use]
    pub const fn new_in(alloc: A) -> Self {
        Self::with_growth_unit_in(alloc, GROWTH_UNIT)
    }

    /// Creates an allocator whose blocks are at least `growth_unit` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `growth_unit` is zero.
    #[must_use]
    pub const fn with_growth_unit_in(alloc: A, growth_unit: usize) -> Self {
        assert!(growth_unit > 0, "growth unit must be positive");
        Self {
            table: Mutex::new(ExtentTable::new(alloc, growth_unit)),
        }
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// `size` must be positive and `align` must be a power of two. The
    /// returned memory is uninitialized.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocateError> {
        self.table.lock().allocate(size, align)
    }

    /// Allocates memory fitting `layout`, which must not be zero-sized.
    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocateError> {
        self.allocate(layout.size(), layout.align())
    }

    /// Returns the extent starting at `ptr` to the free pool.
    ///
    /// Pointers that do not start an occupied extent (foreign pointers,
    /// double frees) are ignored.
    ///
    /// # Safety
    ///
    /// The memory at `ptr` must not be accessed after this call if it was
    /// obtained from this allocator.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        self.table.lock().release(ptr);
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> alloc::vec::Vec<Extent> {
        self.table.lock().extents.iter().copied().collect()
    }
}

#[cfg(feature = "std")]
impl ExtentAllocator<std::alloc::System> {
    /// Creates an allocator backed by the operating system's allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self::new_in(std::alloc::System)
    }
}

#[cfg(feature = "std")]
impl Default for ExtentAllocator<std::alloc::System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for ExtentAllocator<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtentAllocator").finish_non_exhaustive()
    }
}

/// Returns a dangling pointer aligned for `layout`, for zero-sized requests.
pub(crate) fn dangling(layout: Layout) -> NonNull<u8> {
    // `align` is never zero.
    NonNull::new(ptr::without_provenance_mut::<u8>(layout.align())).unwrap_or(NonNull::dangling())
}

unsafe impl<A> Allocator for &ExtentAllocator<A>
where
    A: Allocator,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(dangling(layout), 0));
        }
        let ptr = self.allocate_layout(layout)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            unsafe { self.release(ptr) };
        }
    }
}
