#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

mod allocator;
mod arena;
mod block;
mod free_lists;
mod heap;
mod region;

pub use allocator::{Lock, SegFitAllocator, SingleThreadedLock, SpinLock};
pub use block::{Payload, ALIGNMENT, MIN_BLOCK_SIZE, WORD_SIZE};
pub use free_lists::{size_class, FreeBlocks, NUM_SIZE_CLASSES};
pub use heap::{BlockInfo, Blocks, CheckError, Heap, DEFAULT_CHUNK_SIZE};
pub use region::{AllocatorRegion, Region, SliceRegion};

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}

/// A non-null pointer aligned to [`ALIGNMENT`] that does not point into any
/// allocation.
#[inline]
pub(crate) const fn dangling() -> NonNull<u8> {
    // Safety: `ALIGNMENT` is non-zero.
    unsafe { NonNull::new_unchecked(ALIGNMENT as *mut u8) }
}
