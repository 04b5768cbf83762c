use alloc::collections::TryReserveError;
use core::alloc::{AllocError, LayoutError};

use snafu::{Location, Snafu};

/// Errors returned when an allocation request cannot be satisfied.
///
/// Contract violations (zero-sized requests, alignments that are not a power
/// of two) are not reported here; they are checked with debug assertions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AllocateError {
    #[snafu(display("request of {size} bytes aligned to {align} overflows the address space"))]
    SizeOverflow {
        size: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid layout for a block of {size} bytes"))]
    BlockLayout {
        size: usize,
        #[snafu(source)]
        source: LayoutError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("system allocator refused a block of {size} bytes"))]
    BlockRequest {
        size: usize,
        #[snafu(source)]
        source: AllocError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to grow the extent table"))]
    ExtentTable {
        #[snafu(source)]
        source: TryReserveError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl From<AllocateError> for AllocError {
    fn from(_: AllocateError) -> Self {
        Self
    }
}
