//! The segregated-fit heap.
//!
//! A request is normalized to a block size, then the segregated index is
//! searched first-fit, starting at the request's own size class and moving
//! towards larger classes. A hit is carved down to size by the placer; a miss
//! grows the arena, merges the new space with any trailing free block, and
//! places into that.
//!
//! Released blocks are immediately coalesced with free neighbors, so no two
//! free blocks are ever adjacent.

use core::cmp;

use super::*;
use crate::{
    arena::{Arena, PROLOGUE_REGION_SIZE},
    block::{adjusted_size, align_up, Tag},
    free_lists::{size_class, FreeLists},
};

mod check;
pub use check::CheckError;

/// The default number of bytes to grow the arena by when no free block fits a
/// request. Larger requests grow the arena by exactly what they need.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;

/// Where a block being placed comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    /// A free block that is still filed in its size class.
    FreeList,
    /// An allocated block being shrunk in place. It is in no free list, and
    /// any split-off remainder must be coalesced with its right neighbor.
    InUse,
}

/// A single-threaded memory allocator over one growable [`Region`].
///
/// The heap owns every byte of its region: block headers, footers, and free
/// list links live in the arena next to the payloads they describe. The only
/// bookkeeping kept outside of the arena is one list head per size class.
pub struct Heap<R>
where
    R: Region,
{
    arena: Arena<R>,
    free_lists: FreeLists,
    chunk_size: usize,
}

/// A block seen while walking the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// The block's payload.
    pub payload: Payload,
    /// The block's total size, including its header (and footer, when free).
    pub size: usize,
    /// Whether the block is currently allocated.
    pub allocated: bool,
}

impl<R> Heap<R>
where
    R: Region,
{
    /// Initialize a heap in `region`, growing the arena by
    /// [`DEFAULT_CHUNK_SIZE`] bytes whenever it runs out of free blocks.
    ///
    /// Whatever the region had mapped before is discarded.
    #[inline]
    pub fn new(region: R) -> Result<Self, AllocError> {
        Self::with_chunk_size(region, DEFAULT_CHUNK_SIZE)
    }

    /// Initialize a heap in `region`, growing the arena by at least
    /// `chunk_size` bytes whenever it runs out of free blocks.
    ///
    /// The chunk size is rounded up to the alignment and to at least one
    /// minimum-sized block.
    pub fn with_chunk_size(region: R, chunk_size: usize) -> Result<Self, AllocError> {
        let chunk_size = align_up(cmp::max(chunk_size, MIN_BLOCK_SIZE)).ok_or(AllocError)?;
        let mut heap = Heap {
            arena: Arena::new(region),
            free_lists: FreeLists::new(),
            chunk_size,
        };
        heap.arena.format()?;
        heap.extend(chunk_size / WORD_SIZE)?;
        log::debug!("initialized heap with a {chunk_size}-byte growth chunk");
        heap.debug_check("initialize");
        Ok(heap)
    }

    /// Tear the heap down, handing back its region with nothing mapped.
    ///
    /// Every payload handed out by this heap is invalidated.
    pub fn destroy(self) -> R {
        let mut region = self.arena.into_region();
        region.reset();
        region
    }

    /// Get a shared reference to the underlying region.
    #[inline]
    pub fn region(&self) -> &R {
        self.arena.region()
    }

    /// The minimum number of bytes the arena grows by at a time.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Allocate a block with room for at least `size` bytes.
    ///
    /// Returns `Ok(None)` when `size` is zero. Fails only when the region
    /// cannot grow enough, or `size` is too large to represent, and leaves the
    /// heap unchanged in that case.
    pub fn allocate(&mut self, size: usize) -> Result<Option<Payload>, AllocError> {
        if size == 0 {
            return Ok(None);
        }
        let asize = adjusted_size(size).ok_or(AllocError)?;

        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => {
                let grow_by = cmp::max(asize, self.chunk_size);
                self.extend(grow_by / WORD_SIZE)?
            }
        };
        self.place(block, asize, Source::FreeList);

        log::trace!("allocate({size}) -> {block:?}");
        self.debug_check("allocate");
        Ok(Some(block))
    }

    /// Return a block to the heap.
    ///
    /// `payload` must be a live allocation from this heap. Releasing anything
    /// else, or releasing the same block twice, corrupts the heap's
    /// bookkeeping (though never memory outside of its region).
    pub fn release(&mut self, payload: Payload) {
        let tag = self.arena.header(payload);
        debug_assert!(tag.is_allocated(), "release of free block {payload:?}");
        self.arena.set_boundary_tags(
            payload,
            Tag::pack(tag.size(), false, tag.is_prev_allocated()),
        );
        let block = self.coalesce(payload);

        log::trace!("release({payload:?}) -> merged into {block:?}");
        self.debug_check("release");
    }

    /// Resize a block to hold at least `size` bytes, preserving its contents
    /// up to the smaller of the old and new sizes.
    ///
    /// * With no `payload`, this is [`allocate`][Heap::allocate].
    /// * With a `size` of zero, this is [`release`][Heap::release] and returns
    ///   `Ok(None)`.
    /// * When the block is already big enough it is shrunk in place and the
    ///   same payload is returned.
    /// * Otherwise the contents move to a new block and the old one is
    ///   released. If that new block cannot be allocated, the old block is
    ///   left allocated and untouched.
    pub fn reallocate(
        &mut self,
        payload: Option<Payload>,
        size: usize,
    ) -> Result<Option<Payload>, AllocError> {
        let Some(old) = payload else {
            return self.allocate(size);
        };
        if size == 0 {
            self.release(old);
            return Ok(None);
        }

        let old_usable = self.usable_size(old);
        if size <= old_usable {
            if size < old_usable {
                let asize = adjusted_size(size).ok_or(AllocError)?;
                self.place(old, asize, Source::InUse);
            }
            log::trace!("reallocate({old:?}, {size}) -> in place");
            self.debug_check("reallocate");
            return Ok(Some(old));
        }

        let new = self.allocate(size)?.ok_or(AllocError)?;
        self.arena.copy(old, new, old_usable);
        self.release(old);

        log::trace!("reallocate({old:?}, {size}) -> {new:?}");
        self.debug_check("reallocate");
        Ok(Some(new))
    }

    /// Allocate a zero-filled block with room for `count` elements of `size`
    /// bytes each.
    ///
    /// Fails if `count * size` overflows.
    pub fn zero_allocate(
        &mut self,
        count: usize,
        size: usize,
    ) -> Result<Option<Payload>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError)?;
        let block = self.allocate(total)?;
        if let Some(block) = block {
            self.payload_mut(block).fill(0);
        }
        Ok(block)
    }

    /// The number of bytes usable through `payload`, which is at least as many
    /// as were requested for it.
    #[inline]
    pub fn usable_size(&self, payload: Payload) -> usize {
        self.arena.header(payload).size() - WORD_SIZE
    }

    /// The usable bytes of a live allocation.
    #[inline]
    pub fn payload(&self, payload: Payload) -> &[u8] {
        self.arena.bytes(payload, self.usable_size(payload))
    }

    /// The usable bytes of a live allocation, mutably.
    #[inline]
    pub fn payload_mut(&mut self, payload: Payload) -> &mut [u8] {
        let len = self.usable_size(payload);
        self.arena.bytes_mut(payload, len)
    }

    /// Iterate over every block in the arena, from lowest to highest address.
    #[inline]
    pub fn blocks(&self) -> Blocks<'_, R> {
        Blocks {
            arena: &self.arena,
            next: Payload::new(PROLOGUE_REGION_SIZE),
        }
    }

    /// Iterate over the free blocks filed under size class `class`.
    ///
    /// # Panics
    ///
    /// Panics if `class >= NUM_SIZE_CLASSES`.
    #[inline]
    pub fn free_blocks(&self, class: usize) -> FreeBlocks<'_, R> {
        self.free_lists.iter(&self.arena, class)
    }

    /// Grow the arena and merge the new space into any free block that ended
    /// the arena. The resulting block is filed in the free lists.
    fn extend(&mut self, words: usize) -> Result<Payload, AllocError> {
        let block = self.arena.extend(words)?;
        Ok(self.coalesce(block))
    }

    /// Merge a free block with its free neighbors and file the result.
    ///
    /// `block` must have matching header and footer and must not be in any
    /// free list. Returns the (possibly moved) start of the merged block.
    fn coalesce(&mut self, block: Payload) -> Payload {
        let tag = self.arena.header(block);
        let next = self.arena.next_block(block);
        let next_tag = self.arena.header(next);

        let mut start = block;
        let mut size = tag.size();
        let mut prev_allocated = tag.is_prev_allocated();

        if !next_tag.is_allocated() {
            self.free_lists.remove(&mut self.arena, next);
            size += next_tag.size();
        }

        if !tag.is_prev_allocated() {
            let prev = self.arena.prev_block(block);
            let prev_tag = self.arena.header(prev);
            self.free_lists.remove(&mut self.arena, prev);
            size += prev_tag.size();
            start = prev;
            prev_allocated = prev_tag.is_prev_allocated();
        }

        self.arena
            .set_boundary_tags(start, Tag::pack(size, false, prev_allocated));
        let following = start.forward(size);
        self.arena.set_prev_allocated(following, false);
        self.free_lists.insert(&mut self.arena, start);
        start
    }

    /// First-fit search of the segregated index, from `asize`'s own class
    /// upwards.
    fn find_fit(&self, asize: usize) -> Option<Payload> {
        (size_class(asize)..NUM_SIZE_CLASSES).find_map(|class| {
            self.free_lists
                .iter(&self.arena, class)
                .find(|block| self.arena.header(*block).size() >= asize)
        })
    }

    /// Turn `block` into an allocated block of (at least) `asize` bytes,
    /// splitting off the tail as a new free block when it is big enough to
    /// stand on its own.
    fn place(&mut self, block: Payload, asize: usize, source: Source) {
        let tag = self.arena.header(block);
        let csize = tag.size();
        debug_assert!(csize >= asize);
        debug_assert_eq!(tag.is_allocated(), source == Source::InUse);

        if source == Source::FreeList {
            self.free_lists.remove(&mut self.arena, block);
        }

        if csize - asize >= MIN_BLOCK_SIZE {
            self.arena.set_header(
                block,
                Tag::pack(asize, true, tag.is_prev_allocated()),
            );
            let rest = block.forward(asize);
            self.arena
                .set_boundary_tags(rest, Tag::pack(csize - asize, false, true));
            match source {
                // The block was free, so its right neighbor is allocated and
                // already knows its predecessor is free.
                Source::FreeList => self.free_lists.insert(&mut self.arena, rest),
                // The right neighbor may be free.
                Source::InUse => {
                    self.coalesce(rest);
                }
            }
        } else if source == Source::FreeList {
            self.arena.set_header(
                block,
                Tag::pack(csize, true, tag.is_prev_allocated()),
            );
            let next = block.forward(csize);
            self.arena.set_prev_allocated(next, true);
        }
    }

    /// Run the heap checker after a public operation when the `debug_checks`
    /// feature is enabled.
    #[inline]
    fn debug_check(&self, context: &str) {
        if cfg!(feature = "debug_checks") {
            if let Err(e) = self.check_invariants() {
                panic!("heap invariant violated after {context}: {e}");
            }
        }
    }
}

/// An iterator over every block in a heap's arena.
///
/// Created by [`Heap::blocks`].
pub struct Blocks<'a, R> {
    arena: &'a Arena<R>,
    next: Option<Payload>,
}

impl<R> Iterator for Blocks<'_, R>
where
    R: Region,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.next?;
        let tag = self.arena.header(block);
        if tag.size() == 0 {
            self.next = None;
            return None;
        }
        self.next = Some(block.forward(tag.size()));
        Some(BlockInfo {
            payload: block,
            size: tag.size(),
            allocated: tag.is_allocated(),
        })
    }
}

#[cfg(test)]
mod tests;
