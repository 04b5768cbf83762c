//! General-purpose first-fit heap allocator.
//!
//! This crate provides an allocator that carves extents out of blocks
//! requested from an underlying system allocator, hands them out with any
//! power-of-two alignment and merges neighboring free extents back together
//! on release. It can serve individual callers, generic containers, or the
//! whole process as its global allocator.
//!
//! # Components
//!
//! ## [`ExtentAllocator`]
//!
//! The allocator core. Keeps an ordered table of free and occupied extents
//! behind a single mutex:
//!
//! - **Allocation**: first-fit scan, growing by at least [`GROWTH_UNIT`]
//!   bytes when nothing fits
//! - **Deallocation**: marks the extent free and merges it with its table
//!   neighbors when they are adjacent in memory
//! - **Growth**: blocks obtained from the system allocator are never given
//!   back while the allocator is alive
//!
//! ## [`TypedAllocator`]
//!
//! A copyable per-element-type view over a borrowed [`ExtentAllocator`],
//! usable wherever a container expects a [`core::alloc::Allocator`].
//!
//! ## [`global`]
//!
//! With the `std` feature: a lazily constructed process-wide instance and the
//! [`ExtentGlobalAlloc`](global::ExtentGlobalAlloc) hook for
//! `#[global_allocator]`.
//!
//! # Usage Examples
//!
//! ## Standalone allocator
//!
//! ```rust
//! #![feature(allocator_api)]
//!
//! use extent_alloc::{DEFAULT_ALIGNMENT, ExtentAllocator};
//!
//! let heap = ExtentAllocator::new();
//!
//! let p1 = heap.allocate(8, DEFAULT_ALIGNMENT).unwrap();
//! let p2 = heap.allocate(8, DEFAULT_ALIGNMENT).unwrap();
//! unsafe {
//!     heap.release(p2);
//!     heap.release(p1);
//! }
//!
//! // Both extents were merged, so a request spanning them reuses `p1`.
//! let p3 = heap.allocate(16, DEFAULT_ALIGNMENT).unwrap();
//! assert_eq!(p1, p3);
//! ```
//!
//! ## Global allocator
//!
//! ```rust,no_run
//! use extent_alloc::global::ExtentGlobalAlloc;
//!
//! #[global_allocator]
//! static ALLOCATOR: ExtentGlobalAlloc = ExtentGlobalAlloc;
//!
//! fn main() {
//!     let numbers = vec![1, 2, 3];
//!     assert_eq!(numbers.len(), 3);
//! }
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Releasing is `unsafe`: callers must not touch memory after handing it
//! back. Releasing a pointer the allocator does not know (a foreign pointer
//! or a double free) is ignored.
//!
//! ## Thread Safety
//!
//! [`ExtentAllocator`] is `Sync`; one spin lock per instance serializes every
//! allocation and release.
//!
//! ## Logging
//!
//! Nothing in this crate logs. A log sink would allocate, and when this
//! allocator is the global one that allocation would re-enter it.

#![feature(allocator_api)]
#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

mod error;
mod extent;
mod first_fit;
#[cfg(feature = "std")]
pub mod global;
mod typed;

pub use self::{
    error::AllocateError,
    first_fit::{BLOCK_ALIGN, DEFAULT_ALIGNMENT, ExtentAllocator, GROWTH_UNIT},
    typed::TypedAllocator,
};
