//! The `Allocator` front end.
//!
//! [`SegFitAllocator`] puts a [`Heap`] behind a lock and translates between
//! raw pointers and payload offsets. Because a [`Region`] never moves the
//! bytes it has mapped, a pointer handed out here stays valid until it is
//! deallocated or the allocator is dropped, no matter how much the heap grows
//! in between.
//!
//! The heap aligns every payload to [`ALIGNMENT`]; layouts asking for more
//! than that are refused rather than padded.

use super::*;

mod locked;
pub use locked::{Lock, SingleThreadedLock, SpinLock};
use locked::LockedHeap;

/// A segregated-fit memory allocator over a single growable [`Region`].
///
/// Implements the [`Allocator`] trait, so it can back collections directly,
/// or by reference via `&SegFitAllocator`. With a [`SpinLock`] and a `Send`
/// region it is also `Sync`.
///
/// ```
/// use core::alloc::Layout;
/// use segfit::{Allocator, SegFitAllocator, SingleThreadedLock, SliceRegion};
///
/// let mut memory = vec![0u8; 1 << 16];
/// let allocator = SegFitAllocator::from_region(
///     SliceRegion::new(&mut memory),
///     SingleThreadedLock::new(),
/// )
/// .unwrap();
///
/// let layout = Layout::from_size_align(100, 8).unwrap();
/// let block = allocator.allocate_zeroed(layout).unwrap();
/// assert!(block.len() >= 100);
/// unsafe { allocator.deallocate(block.cast(), layout) };
/// ```
pub struct SegFitAllocator<R, L>
where
    R: Region,
    L: Lock,
{
    heap: LockedHeap<R, L>,
}

impl<R, L> SegFitAllocator<R, L>
where
    R: Region,
    L: Lock,
{
    /// Create a new `SegFitAllocator` that serves allocations from `heap`.
    #[inline]
    pub const fn new(heap: Heap<R>, lock: L) -> Self {
        SegFitAllocator {
            heap: LockedHeap::new(heap, lock),
        }
    }

    /// Initialize a fresh heap in `region` and wrap it.
    #[inline]
    pub fn from_region(region: R, lock: L) -> Result<Self, AllocError> {
        Ok(Self::new(Heap::new(region)?, lock))
    }

    /// Get an exclusive reference to the underlying heap.
    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap<R> {
        self.heap.get_mut()
    }

    /// Run `f` with the heap locked.
    ///
    /// Calling back into this allocator from `f` re-enters the lock.
    #[inline]
    pub fn with_heap<T>(&self, f: impl FnOnce(&Heap<R>) -> T) -> T {
        f(&self.heap.lock())
    }

    /// Unwrap the underlying heap.
    #[inline]
    pub fn into_heap(self) -> Heap<R> {
        self.heap.into_inner()
    }

    fn check_layout(layout: Layout) -> Result<(), AllocError> {
        if layout.align() > ALIGNMENT {
            log::debug!("refusing over-aligned layout {layout:?}");
            return Err(AllocError);
        }
        Ok(())
    }

    /// Resize a non-empty allocation through the heap's `reallocate`.
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        Self::check_layout(new_layout)?;
        let mut heap = self.heap.lock();
        let old = heap.payload_of(ptr);
        let new = heap.reallocate(Some(old), new_layout.size())?;
        Ok(heap.block_or_empty(new))
    }
}

unsafe impl<R, L> Allocator for SegFitAllocator<R, L>
where
    R: Region,
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        Self::check_layout(layout)?;
        let mut heap = self.heap.lock();
        let payload = heap.allocate(layout.size())?;
        Ok(heap.block_or_empty(payload))
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        Self::check_layout(layout)?;
        let mut heap = self.heap.lock();
        let payload = heap.zero_allocate(1, layout.size())?;
        Ok(heap.block_or_empty(payload))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        let mut heap = self.heap.lock();
        let payload = heap.payload_of(ptr);
        heap.release(payload);
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }
        self.resize(ptr, new_layout)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if old_layout.size() == 0 {
            return self.allocate_zeroed(new_layout);
        }
        let block = self.resize(ptr, new_layout)?;

        // Everything past the caller's old bytes may hold stale data, either
        // slop in the old block or whatever the new block held last.
        let tail = block.cast::<u8>().add(old_layout.size());
        tail.write_bytes(0, block.len() - old_layout.size());
        Ok(block)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        Self::check_layout(new_layout)?;
        if old_layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(dangling(), 0));
        }
        self.resize(ptr, new_layout)
    }
}
