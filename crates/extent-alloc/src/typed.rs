//! Typed view over an [`ExtentAllocator`].
//!
//! [`TypedAllocator`] sizes requests in elements of `T` instead of bytes and
//! holds nothing but a reference to the allocator it forwards to, so it can
//! be copied freely and handed to generic containers.

use core::{
    alloc::{AllocError, Allocator, Layout},
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
};

use snafu::OptionExt as _;

use crate::{
    error::{AllocateError, SizeOverflowSnafu},
    first_fit::{self, ExtentAllocator},
};

/// Allocates storage for values of type `T` from a borrowed
/// [`ExtentAllocator`].
///
/// Two typed allocators compare equal when they forward to the same
/// allocator instance, whatever their element types.
///
/// # Examples
///
/// ```rust
/// #![feature(allocator_api)]
///
/// use extent_alloc::{ExtentAllocator, TypedAllocator};
///
/// let heap = ExtentAllocator::new();
/// let words = TypedAllocator::<u64, _>::new(&heap);
///
/// let ptr = words.allocate(4).unwrap();
/// unsafe {
///     ptr.write(7);
///     assert_eq!(ptr.read(), 7);
///     words.deallocate(ptr);
/// }
///
/// // Containers take it as their allocator.
/// let mut vec = Vec::new_in(words.rebind::<u8>());
/// vec.push(1_u8);
/// ```
pub struct TypedAllocator<'a, T, A: Allocator> {
    raw: &'a ExtentAllocator<A>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T, A> TypedAllocator<'a, T, A>
where
    A: Allocator,
{
    /// Creates a typed allocator forwarding to `raw`.
    #[must_use]
    pub const fn new(raw: &'a ExtentAllocator<A>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Returns a typed allocator for `U` sharing the same allocator.
    #[must_use]
    pub const fn rebind<U>(self) -> TypedAllocator<'a, U, A> {
        TypedAllocator::new(self.raw)
    }

    /// Returns the allocator this view forwards to.
    #[must_use]
    pub const fn inner(&self) -> &'a ExtentAllocator<A> {
        self.raw
    }

    /// Allocates uninitialized storage for `n` values of `T`.
    ///
    /// A request of zero bytes (`n == 0` or a zero-sized `T`) returns a
    /// dangling, well-aligned pointer.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, AllocateError> {
        let align = align_of::<T>();
        let size = n
            .checked_mul(size_of::<T>())
            .context(SizeOverflowSnafu { size: n, align })?;
        if size == 0 {
            return Ok(NonNull::dangling());
        }
        Ok(self.raw.allocate(size, align)?.cast())
    }

    /// Releases storage obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The storage must not be accessed after this call.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>) {
        unsafe { self.raw.release(ptr.cast()) };
    }
}

#[cfg(feature = "std")]
impl<T> Default for TypedAllocator<'static, T, std::alloc::System> {
    /// Forwards to the process-wide allocator.
    fn default() -> Self {
        Self::new(crate::global::instance())
    }
}

impl<T, A> Clone for TypedAllocator<'_, T, A>
where
    A: Allocator,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A> Copy for TypedAllocator<'_, T, A> where A: Allocator {}

impl<T, U, A> PartialEq<TypedAllocator<'_, U, A>> for TypedAllocator<'_, T, A>
where
    A: Allocator,
{
    fn eq(&self, other: &TypedAllocator<'_, U, A>) -> bool {
        ptr::eq(self.raw, other.raw)
    }
}

impl<T, A> Eq for TypedAllocator<'_, T, A> where A: Allocator {}

impl<T, A> fmt::Debug for TypedAllocator<'_, T, A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedAllocator")
            .field("raw", &ptr::from_ref(self.raw))
            .finish()
    }
}

unsafe impl<T, A> Allocator for TypedAllocator<'_, T, A>
where
    A: Allocator,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(
                first_fit::dangling(layout),
                0,
            ));
        }
        let ptr = self.raw.allocate_layout(layout)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            unsafe { self.raw.release(ptr) };
        }
    }
}
