//! Growable memory regions backing a heap.
//!
//! A region is a contiguous reservation with a moving break, in the style of
//! `sbrk`: [`Region::grow`] hands out the next `delta` bytes past the current
//! break and never relocates what was handed out before.

use core::{marker::PhantomData, ptr::NonNull};

use super::*;

/// The region-growth primitive a [`Heap`] is layered on top of.
///
/// # Safety
///
/// * [`base`][Region::base] must be aligned to [`ALIGNMENT`] and must not
///   change for as long as the region is alive. Growing the region must never
///   move previously mapped bytes. Pointers handed out by a
///   [`SegFitAllocator`] are derived from the base and must stay valid.
///
/// * [`as_slice`][Region::as_slice] and [`as_mut_slice`][Region::as_mut_slice]
///   must cover exactly the bytes in `[base, base + len)`, where `len` is the
///   sum of every successful `grow` since the last `reset`.
pub unsafe trait Region {
    /// The start of the region.
    fn base(&self) -> NonNull<u8>;

    /// The currently mapped bytes.
    fn as_slice(&self) -> &[u8];

    /// The currently mapped bytes, mutably.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Map `delta` more bytes, returning the offset of the old break, which is
    /// where the new bytes start.
    ///
    /// On failure the region is left untouched.
    fn grow(&mut self, delta: usize) -> Result<usize, AllocError>;

    /// Unmap everything, moving the break back to the base.
    fn reset(&mut self);

    /// The number of currently mapped bytes.
    #[inline]
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Is nothing mapped?
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The lowest mapped address.
    #[inline]
    fn low(&self) -> *const u8 {
        self.base().as_ptr().cast_const()
    }

    /// The highest mapped address, or one below the base if nothing is mapped.
    #[inline]
    fn high(&self) -> *const u8 {
        self.low().wrapping_add(self.len()).wrapping_sub(1)
    }
}

/// A fixed-capacity region over caller-provided memory.
///
/// The start of the given memory is skipped as needed to reach
/// [`ALIGNMENT`]; everything after that is capacity. Growing past the
/// capacity fails.
#[derive(Debug)]
pub struct SliceRegion<'a> {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
    _memory: PhantomData<&'a mut [u8]>,
}

impl<'a> SliceRegion<'a> {
    /// Create a new, empty region that may grow into `memory`.
    pub fn new(memory: &'a mut [u8]) -> Self {
        let start = memory.as_mut_ptr();
        let skip = core::cmp::min(start.align_offset(ALIGNMENT), memory.len());
        let capacity = memory.len() - skip;
        // Safety: `skip <= memory.len()`, so the result is in bounds or one
        // past the end, and derived from a non-null slice pointer.
        let base = unsafe { NonNull::new_unchecked(start.add(skip)) };
        let base = if capacity == 0 { dangling() } else { base };
        SliceRegion {
            base,
            capacity,
            brk: 0,
            _memory: PhantomData,
        }
    }

    /// The total number of bytes this region may grow to.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// Safety: the region stands in for the `&'a mut [u8]` it was built from.
unsafe impl Send for SliceRegion<'_> {}

unsafe impl Region for SliceRegion<'_> {
    #[inline]
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // Safety: `[base, base + brk)` lies inside the borrowed memory.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.brk) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, and we hold the only borrow of the memory.
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.brk) }
    }

    fn grow(&mut self, delta: usize) -> Result<usize, AllocError> {
        if self.capacity - self.brk < delta {
            log::warn!(
                "region exhausted: cannot grow by {delta} bytes ({} of {} in use)",
                self.brk,
                self.capacity
            );
            return Err(AllocError);
        }
        let old_brk = self.brk;
        self.brk += delta;
        Ok(old_brk)
    }

    #[inline]
    fn reset(&mut self) {
        self.brk = 0;
    }
}

/// A fixed-capacity region whose memory is reserved from an inner allocator
/// up front and given back to it on drop.
pub struct AllocatorRegion<A>
where
    A: Allocator,
{
    inner: A,
    base: NonNull<u8>,
    layout: Layout,
    brk: usize,
}

impl<A> AllocatorRegion<A>
where
    A: Allocator,
{
    /// Reserve `capacity` bytes from `inner` for a new, empty region.
    pub fn new(inner: A, capacity: usize) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(capacity, ALIGNMENT).map_err(|_| AllocError)?;
        let base = inner.allocate(layout)?.cast::<u8>();
        log::debug!("reserved a {capacity}-byte region at {base:p}");
        Ok(AllocatorRegion {
            inner,
            base,
            layout,
            brk: 0,
        })
    }

    /// The total number of bytes this region may grow to.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A> Drop for AllocatorRegion<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        // Safety: the reservation was allocated with `self.inner` and this
        // layout, and nothing references it once the region is gone.
        unsafe { self.inner.deallocate(self.base, self.layout) };
    }
}

// Safety: the reservation is owned by the region and freed through `inner`.
unsafe impl<A> Send for AllocatorRegion<A> where A: Allocator + Send {}

unsafe impl<A> Region for AllocatorRegion<A>
where
    A: Allocator,
{
    #[inline]
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // Safety: `[base, base + brk)` lies inside the reservation.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.brk) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, and the reservation is owned by this region.
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.brk) }
    }

    fn grow(&mut self, delta: usize) -> Result<usize, AllocError> {
        if self.capacity() - self.brk < delta {
            log::warn!(
                "region exhausted: cannot grow by {delta} bytes ({} of {} in use)",
                self.brk,
                self.capacity()
            );
            return Err(AllocError);
        }
        let old_brk = self.brk;
        self.brk += delta;
        Ok(old_brk)
    }

    #[inline]
    fn reset(&mut self) {
        self.brk = 0;
    }
}
