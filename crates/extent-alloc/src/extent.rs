//! Extents: the unit of bookkeeping of the first-fit allocator.
//!
//! An [`Extent`] describes one contiguous range of memory carved out of a
//! block obtained from the underlying system allocator. The extent itself is
//! a plain value; it never reads or writes the memory it describes.
//!
//! ```text
//! Block from the system allocator:
//! ┌────────────────────┬────────────┬───────────────────────────┐
//! │ first (free)       │ occupied   │ free                      │
//! │ is_first = true    │            │                           │
//! └────────────────────┴────────────┴───────────────────────────┘
//!  ptr ───────────────▶ ptr ───────▶ ptr
//! ```
//!
//! Splitting never produces a first extent, so the `is_first` flag always
//! marks the start of a block. Merging refuses to swallow a first extent,
//! which keeps blocks that happen to be address-adjacent apart.

use core::ptr::NonNull;

/// A contiguous memory range inside one block, either free or occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    /// Set only on the extent starting at the beginning of a block.
    is_first: bool,
    is_free: bool,
    size: usize,
    ptr: NonNull<u8>,
}

impl Extent {
    /// Creates the extent covering a whole block freshly obtained from the
    /// system allocator.
    pub(crate) fn block(ptr: NonNull<u8>, size: usize) -> Self {
        debug_assert!(size > 0, "block size must be positive");
        Self {
            is_first: true,
            is_free: true,
            size,
            ptr,
        }
    }

    fn remainder(ptr: NonNull<u8>, size: usize) -> Self {
        Self {
            is_first: false,
            is_free: true,
            size,
            ptr,
        }
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Address one past the last byte of this extent.
    pub(crate) fn end(&self) -> usize {
        self.ptr.addr().get() + self.size
    }

    pub(crate) fn is_free(&self) -> bool {
        self.is_free
    }

    pub(crate) fn is_first(&self) -> bool {
        self.is_first
    }

    pub(crate) fn mark_occupied(&mut self) {
        debug_assert!(self.is_free, "extent is already occupied");
        self.is_free = false;
    }

    pub(crate) fn mark_free(&mut self) {
        debug_assert!(!self.is_free, "extent is already free");
        self.is_free = true;
    }

    /// Returns `true` if `request_size` bytes aligned to `align` fit in this
    /// extent once its start is rounded up to `align`.
    ///
    /// The extent must be free, `request_size` must be positive and `align`
    /// must be a power of two.
    pub(crate) fn can_fit(&self, request_size: usize, align: usize) -> bool {
        debug_assert!(self.is_free, "only free extents can be fit-tested");
        debug_assert!(request_size > 0, "request size must be positive");
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");

        let align_offset = self.ptr.as_ptr().align_offset(align);
        align_offset
            .checked_add(request_size)
            .is_some_and(|needed| needed <= self.size)
    }

    /// Splits off the part of this extent that starts at the first address
    /// aligned to `align`.
    ///
    /// Returns `None` and leaves the extent untouched if it is already
    /// aligned. Otherwise this extent shrinks to the unaligned gap and the
    /// aligned remainder is returned as a new free extent.
    pub(crate) fn split_alignment(&mut self, align: usize) -> Option<Self> {
        debug_assert!(self.is_free, "only free extents can be split");
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");

        let align_offset = self.ptr.as_ptr().align_offset(align);
        if align_offset == 0 {
            return None;
        }
        debug_assert!(
            align_offset < self.size,
            "aligned address is out of the extent"
        );

        // In bounds: the offset is smaller than the extent, which lies inside
        // a single block.
        let aligned_ptr = unsafe { self.ptr.add(align_offset) };
        let aligned = Self::remainder(aligned_ptr, self.size - align_offset);
        self.size = align_offset;
        Some(aligned)
    }

    /// Splits this extent so that it keeps exactly `split_size` bytes.
    ///
    /// Returns `None` if the extent already has that size, otherwise the tail
    /// is returned as a new free extent.
    pub(crate) fn split_size(&mut self, split_size: usize) -> Option<Self> {
        debug_assert!(self.is_free, "only free extents can be split");
        debug_assert!(
            split_size > 0 && split_size <= self.size,
            "split size {split_size} is out of range for an extent of {} bytes",
            self.size
        );

        if split_size == self.size {
            return None;
        }

        let rest_ptr = unsafe { self.ptr.add(split_size) };
        let rest = Self::remainder(rest_ptr, self.size - split_size);
        self.size = split_size;
        Some(rest)
    }

    /// Absorbs `other` into this extent if it directly follows it.
    ///
    /// Fails without mutation unless `other` is a free, non-first extent
    /// starting exactly at this extent's end. On success the caller must drop
    /// `other` from its collection.
    pub(crate) fn merge(&mut self, other: &Self) -> bool {
        debug_assert!(self.is_free, "only a free extent can absorb another");

        if !other.is_free || other.is_first {
            return false;
        }
        if other.ptr <= self.ptr {
            return false;
        }
        if self.end() != other.ptr.addr().get() {
            return false;
        }

        self.size += other.size;
        true
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use core::alloc::Layout;

    use super::*;

    fn with_test_block<F>(size: usize, test_fn: F)
    where
        F: FnOnce(NonNull<u8>),
    {
        unsafe {
            let layout = Layout::from_size_align(size, 4096).unwrap();
            let block = NonNull::new(alloc::alloc::alloc(layout)).unwrap();
            test_fn(block);
            alloc::alloc::dealloc(block.as_ptr(), layout);
        }
    }

    #[test]
    fn test_can_fit_aligned_start() {
        with_test_block(64, |block| {
            let extent = Extent::block(block, 64);
            assert!(extent.can_fit(64, 8));
            assert!(extent.can_fit(1, 4096));
            assert!(!extent.can_fit(65, 8));
        });
    }

    #[test]
    fn test_can_fit_accounts_for_alignment_gap() {
        with_test_block(128, |block| {
            let extent = Extent::block(unsafe { block.add(8) }, 120);
            // 8 bytes of padding are needed to reach a 16-byte boundary.
            assert!(extent.can_fit(112, 16));
            assert!(!extent.can_fit(113, 16));
            assert!(extent.can_fit(120, 8));
        });
    }

    #[test]
    fn test_can_fit_overflowing_request() {
        with_test_block(64, |block| {
            let extent = Extent::block(unsafe { block.add(1) }, 63);
            assert!(!extent.can_fit(usize::MAX, 8));
        });
    }

    #[test]
    fn test_split_alignment_already_aligned() {
        with_test_block(64, |block| {
            let mut extent = Extent::block(block, 64);
            assert_eq!(extent.split_alignment(32), None);
            assert_eq!(extent.size(), 64);
        });
    }

    #[test]
    fn test_split_alignment() {
        with_test_block(256, |block| {
            let mut extent = Extent::block(unsafe { block.add(24) }, 200);
            let aligned = extent.split_alignment(64).unwrap();

            assert_eq!(extent.size(), 40);
            assert!(extent.is_first());
            assert_eq!(aligned.ptr(), unsafe { block.add(64) });
            assert_eq!(aligned.size(), 160);
            assert!(aligned.is_free());
            assert!(!aligned.is_first());
            assert_eq!(extent.end(), aligned.ptr().addr().get());
        });
    }

    #[test]
    fn test_split_size_exact() {
        with_test_block(64, |block| {
            let mut extent = Extent::block(block, 64);
            assert_eq!(extent.split_size(64), None);
            assert_eq!(extent.size(), 64);
        });
    }

    #[test]
    fn test_split_size() {
        with_test_block(64, |block| {
            let mut extent = Extent::block(block, 64);
            let rest = extent.split_size(24).unwrap();

            assert_eq!(extent.size(), 24);
            assert_eq!(rest.ptr(), unsafe { block.add(24) });
            assert_eq!(rest.size(), 40);
            assert!(rest.is_free());
            assert!(!rest.is_first());
        });
    }

    #[test]
    #[should_panic(expected = "out of range")]
    #[cfg(debug_assertions)]
    fn test_split_size_too_large() {
        with_test_block(64, |block| {
            let mut extent = Extent::block(block, 64);
            let _ = extent.split_size(65);
        });
    }

    #[test]
    fn test_merge_adjacent() {
        with_test_block(64, |block| {
            let mut head = Extent::block(block, 64);
            let tail = head.split_size(16).unwrap();

            assert!(head.merge(&tail));
            assert_eq!(head.size(), 64);
            assert!(head.is_first());
        });
    }

    #[test]
    fn test_merge_rejects_lower_address() {
        with_test_block(64, |block| {
            let head = Extent::block(block, 64);
            let mut head_copy = head;
            let mut tail = head_copy.split_size(16).unwrap();
            let lower = Extent::remainder(head.ptr(), 16);

            assert!(!tail.merge(&lower));
            assert_eq!(tail.size(), 48);
        });
    }

    #[test]
    fn test_merge_rejects_gap() {
        with_test_block(64, |block| {
            let mut head = Extent::block(block, 64);
            let mut middle = head.split_size(16).unwrap();
            let tail = middle.split_size(16).unwrap();

            assert!(!head.merge(&tail));
            assert_eq!(head.size(), 16);
        });
    }

    #[test]
    fn test_merge_rejects_occupied() {
        with_test_block(64, |block| {
            let mut head = Extent::block(block, 64);
            let mut tail = head.split_size(16).unwrap();
            tail.mark_occupied();

            assert!(!head.merge(&tail));
            assert_eq!(head.size(), 16);
        });
    }

    #[test]
    fn test_merge_rejects_first_of_block() {
        with_test_block(128, |block| {
            // Two blocks that happen to sit next to each other.
            let mut lower = Extent::block(block, 64);
            let upper = Extent::block(unsafe { block.add(64) }, 64);

            assert!(!lower.merge(&upper));
            assert_eq!(lower.size(), 64);
        });
    }

    #[test]
    fn test_mark_occupied_and_free() {
        with_test_block(64, |block| {
            let mut extent = Extent::block(block, 64);
            extent.mark_occupied();
            assert!(!extent.is_free());
            extent.mark_free();
            assert!(extent.is_free());
        });
    }
}
