//! Process-wide allocator instance and the global allocation hook.
//!
//! [`instance`] lazily builds one [`ExtentAllocator`] for the whole process.
//! The instance lives in memory requested directly from [`System`], never
//! through the global allocator, so it can back [`ExtentGlobalAlloc`]
//! without recursing into itself. It is never dropped.
//!
//! ```rust,ignore
//! use extent_alloc::global::ExtentGlobalAlloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: ExtentGlobalAlloc = ExtentGlobalAlloc;
//! ```

use core::{
    alloc::{Allocator as _, GlobalAlloc, Layout},
    ptr::{self, NonNull},
};
use std::alloc::{System, handle_alloc_error};

use spin::Once;

use crate::first_fit::ExtentAllocator;

static INSTANCE: Once<&'static ExtentAllocator<System>> = Once::new();

#[cfg(test)]
static CONSTRUCTED: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

/// Returns the process-wide allocator, creating it on first use.
///
/// Concurrent first calls construct exactly one instance; every caller
/// observes the same reference.
pub fn instance() -> &'static ExtentAllocator<System> {
    INSTANCE.call_once(|| unsafe { construct_in_system_memory() })
}

/// Builds the process-wide instance in place, in memory taken straight from
/// [`System`].
///
/// # Safety
///
/// Must run at most once per process; the memory is leaked on purpose.
unsafe fn construct_in_system_memory() -> &'static ExtentAllocator<System> {
    #[cfg(test)]
    CONSTRUCTED.fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    let layout = Layout::new::<ExtentAllocator<System>>();
    let Ok(memory) = System.allocate(layout) else {
        handle_alloc_error(layout);
    };
    let instance = memory.cast::<ExtentAllocator<System>>();
    unsafe {
        instance.write(ExtentAllocator::new());
        instance.as_ref()
    }
}

/// Global allocation hook routing every heap allocation of the process to
/// [`instance`].
///
/// Failed allocations return null, which the runtime reports through
/// [`handle_alloc_error`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtentGlobalAlloc;

unsafe impl GlobalAlloc for ExtentGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        instance()
            .allocate_layout(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { instance().release(ptr) };
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;
    use core::sync::atomic::Ordering;
    use std::{sync::Barrier, thread};

    use super::*;
    use crate::TypedAllocator;

    #[test]
    fn test_single_instance_under_contention() {
        let num_threads = 16;
        let barrier = Barrier::new(num_threads);

        let addrs = thread::scope(|scope| {
            let handles = (0..num_threads)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        ptr::from_ref(instance()).addr()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert!(addrs.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(addrs[0], ptr::from_ref(instance()).addr());
        assert_eq!(CONSTRUCTED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hook_round_trip() {
        let hook = ExtentGlobalAlloc;
        let layout = Layout::from_size_align(100, 32).unwrap();
        unsafe {
            let ptr = hook.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr.addr() % 32, 0);
            ptr.write_bytes(0xAB, 100);
            hook.dealloc(ptr, layout);

            let zeroed = hook.alloc_zeroed(layout);
            assert!((0..100).all(|i| zeroed.add(i).read() == 0));
            hook.dealloc(zeroed, layout);

            // Null is never a live extent.
            hook.dealloc(ptr::null_mut(), layout);
        }
    }

    #[test]
    fn test_hook_reports_exhaustion_as_null() {
        let hook = ExtentGlobalAlloc;
        let layout = Layout::from_size_align(usize::MAX / 2 - 64, 8).unwrap();
        unsafe {
            assert!(hook.alloc(layout).is_null());
        }
    }

    #[test]
    fn test_hook_realloc_preserves_contents() {
        let hook = ExtentGlobalAlloc;
        let layout = Layout::from_size_align(16, 8).unwrap();
        unsafe {
            let ptr = hook.alloc(layout);
            for i in 0..16 {
                ptr.add(i).write(u8::try_from(i).unwrap());
            }
            let grown = hook.realloc(ptr, layout, 8192);
            assert!(!grown.is_null());
            for i in 0..16 {
                assert_eq!(grown.add(i).read(), u8::try_from(i).unwrap());
            }
            hook.dealloc(grown, Layout::from_size_align(8192, 8).unwrap());
        }
    }

    #[test]
    fn test_default_typed_allocator_uses_instance() {
        let typed = TypedAllocator::<u32, System>::default();
        assert!(ptr::eq(typed.inner(), instance()));
        assert_eq!(typed, TypedAllocator::<u8, System>::new(instance()));
    }
}
