//! The segregated free-list index.
//!
//! Free blocks are bucketed into [`NUM_SIZE_CLASSES`] size classes. Each class
//! owns an unordered, doubly linked list threaded through the payloads of its
//! free blocks, so the index itself is just one head per class.

use super::*;
use crate::arena::Arena;

/// The number of size classes in the segregated index.
pub const NUM_SIZE_CLASSES: usize = 9;

/// Inclusive upper bound on block size for every class but the last, which
/// takes everything larger.
///
/// The minimum block size gets a class of its own: it is by far the most
/// common size for small requests, and keeping it apart keeps the lists that
/// larger requests search short.
const CLASS_UPPER_BOUNDS: [usize; NUM_SIZE_CLASSES - 1] =
    [MIN_BLOCK_SIZE, 48, 64, 128, 256, 1024, 4096, 8192];

/// The size class a free block of `size` bytes is filed under.
///
/// Monotonic in `size`: a bigger block never lands in a smaller class, so a
/// search that starts at a request's own class and moves upward sees every
/// block large enough to satisfy it.
#[inline]
pub fn size_class(size: usize) -> usize {
    CLASS_UPPER_BOUNDS
        .iter()
        .position(|bound| size <= *bound)
        .unwrap_or(NUM_SIZE_CLASSES - 1)
}

pub(crate) struct FreeLists {
    heads: [Option<Payload>; NUM_SIZE_CLASSES],
}

impl FreeLists {
    pub(crate) const fn new() -> Self {
        FreeLists {
            heads: [None; NUM_SIZE_CLASSES],
        }
    }

    #[inline]
    pub(crate) fn head(&self, class: usize) -> Option<Payload> {
        self.heads[class]
    }

    /// Push `block` on the front of `class`'s list.
    pub(crate) fn push<R>(&mut self, arena: &mut Arena<R>, class: usize, block: Payload)
    where
        R: Region,
    {
        let head = self.heads[class];
        arena.set_link_prev(block, None);
        arena.set_link_next(block, head);
        if let Some(head) = head {
            arena.set_link_prev(head, Some(block));
        }
        self.heads[class] = Some(block);
    }

    /// Unlink `block` from `class`'s list, wherever in the list it is.
    pub(crate) fn delete<R>(&mut self, arena: &mut Arena<R>, class: usize, block: Payload)
    where
        R: Region,
    {
        let prev = arena.link_prev(block);
        let next = arena.link_next(block);
        match prev {
            Some(prev) => arena.set_link_next(prev, next),
            None => {
                debug_assert_eq!(self.heads[class], Some(block));
                self.heads[class] = next;
            }
        }
        if let Some(next) = next {
            arena.set_link_prev(next, prev);
        }
    }

    /// File a free block under the class of its current size.
    #[inline]
    pub(crate) fn insert<R>(&mut self, arena: &mut Arena<R>, block: Payload)
    where
        R: Region,
    {
        let class = size_class(arena.header(block).size());
        self.push(arena, class, block);
    }

    /// Remove a free block from the class of its current size.
    #[inline]
    pub(crate) fn remove<R>(&mut self, arena: &mut Arena<R>, block: Payload)
    where
        R: Region,
    {
        let class = size_class(arena.header(block).size());
        self.delete(arena, class, block);
    }

    pub(crate) fn iter<'a, R>(&self, arena: &'a Arena<R>, class: usize) -> FreeBlocks<'a, R>
    where
        R: Region,
    {
        FreeBlocks {
            arena,
            next: self.heads[class],
        }
    }
}

/// An iterator over the members of one size class's free list, front to
/// back.
///
/// Created by [`Heap::free_blocks`].
pub struct FreeBlocks<'a, R> {
    arena: &'a Arena<R>,
    next: Option<Payload>,
}

impl<R> Iterator for FreeBlocks<'_, R>
where
    R: Region,
{
    type Item = Payload;

    fn next(&mut self) -> Option<Payload> {
        let block = self.next?;
        self.next = self.arena.link_next(block);
        Some(block)
    }
}
