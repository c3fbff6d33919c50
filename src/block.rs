//! Boundary-tag encoding for blocks.
//!
//! Every block starts with a one-word header. Free blocks repeat the header in
//! a footer at their last word, allocated blocks do not:
//!
//! ```text
//!   free:       | header | prev link | next link | ...padding... | footer |
//!   allocated:  | header | payload .................................... |
//!                        ^
//!                        payload offset
//! ```
//!
//! The header packs the block size, which is always a multiple of
//! [`ALIGNMENT`], together with two status bits in the low nibble:
//!
//! * bit 0: this block is allocated;
//! * bit 1: the block immediately before this one is allocated.
//!
//! The second bit is what lets allocated blocks drop their footer: nothing
//! ever needs to look at the footer of an allocated block to find out whether
//! it can be merged with.

use core::{fmt, num::NonZeroUsize};

/// The size of one machine word in the arena, in bytes.
///
/// Headers, footers, and free-list links each occupy exactly one word.
pub const WORD_SIZE: usize = 8;

/// Two words.
pub(crate) const DOUBLE_WORD_SIZE: usize = 2 * WORD_SIZE;

/// The alignment of every payload handed out by the heap, and the granularity
/// of every block size.
pub const ALIGNMENT: usize = 16;

/// The smallest block the heap ever creates.
///
/// A free block needs room for its header, two free-list links, and its
/// footer.
pub const MIN_BLOCK_SIZE: usize = 2 * DOUBLE_WORD_SIZE;

const ALLOCATED_BIT: u64 = 0b01;
const PREV_ALLOCATED_BIT: u64 = 0b10;
const STATUS_MASK: u64 = (ALIGNMENT as u64) - 1;

/// A packed header or footer word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(u64);

impl Tag {
    #[inline]
    pub(crate) const fn pack(size: usize, allocated: bool, prev_allocated: bool) -> Tag {
        debug_assert!(size as u64 & STATUS_MASK == 0);
        let mut word = size as u64;
        if allocated {
            word |= ALLOCATED_BIT;
        }
        if prev_allocated {
            word |= PREV_ALLOCATED_BIT;
        }
        Tag(word)
    }

    #[inline]
    pub(crate) const fn from_word(word: u64) -> Tag {
        Tag(word)
    }

    #[inline]
    pub(crate) const fn word(self) -> u64 {
        self.0
    }

    /// The block size, with every status bit masked out.
    #[inline]
    pub(crate) const fn size(self) -> usize {
        (self.0 & !STATUS_MASK) as usize
    }

    #[inline]
    pub(crate) const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }

    #[inline]
    pub(crate) const fn is_prev_allocated(self) -> bool {
        self.0 & PREV_ALLOCATED_BIT != 0
    }

    #[inline]
    pub(crate) const fn with_prev_allocated(self, prev_allocated: bool) -> Tag {
        Tag::pack(self.size(), self.is_allocated(), prev_allocated)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .field("prev_allocated", &self.is_prev_allocated())
            .finish()
    }
}

/// The location of a block's payload, as a byte offset from the start of the
/// heap's region.
///
/// Payloads are only ever created by a [`Heap`][crate::Heap]. Offset zero is
/// always inside the heap's prologue, so a payload is never zero and
/// `Option<Payload>` is the same size as `Payload`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(NonZeroUsize);

impl Payload {
    #[inline]
    pub(crate) const fn new(offset: usize) -> Option<Payload> {
        match NonZeroUsize::new(offset) {
            Some(offset) => Some(Payload(offset)),
            None => None,
        }
    }

    /// The byte offset of this payload from the start of the region.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0.get()
    }

    /// Offset of this block's header.
    #[inline]
    pub(crate) const fn header(self) -> usize {
        self.offset() - WORD_SIZE
    }

    /// Offset of this block's footer, given the block's size.
    #[inline]
    pub(crate) const fn footer(self, size: usize) -> usize {
        self.offset() + size - DOUBLE_WORD_SIZE
    }

    /// The payload `bytes` further along in the arena.
    #[inline]
    pub(crate) fn forward(self, bytes: usize) -> Payload {
        Payload(self.0.saturating_add(bytes))
    }

    /// The payload `bytes` earlier in the arena.
    #[inline]
    pub(crate) fn back(self, bytes: usize) -> Payload {
        let offset = self.offset() - bytes;
        Payload::new(offset).unwrap_or_else(|| panic!("no block starts at arena offset zero"))
    }
}

/// Encode an optional payload as an in-arena link word.
#[inline]
pub(crate) fn encode_link(link: Option<Payload>) -> u64 {
    link.map_or(0, |payload| payload.offset() as u64)
}

/// Decode an in-arena link word.
#[inline]
pub(crate) fn decode_link(word: u64) -> Option<Payload> {
    Payload::new(word as usize)
}

/// Round `size` up to the next multiple of [`ALIGNMENT`].
#[inline]
pub(crate) fn align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
}

/// The block size needed to hand out `size` usable bytes: room for the header,
/// rounded up to the alignment, and never less than [`MIN_BLOCK_SIZE`].
///
/// Returns `None` if the computation overflows.
#[inline]
pub(crate) fn adjusted_size(size: usize) -> Option<usize> {
    if size <= DOUBLE_WORD_SIZE {
        Some(MIN_BLOCK_SIZE)
    } else {
        align_up(size.checked_add(WORD_SIZE)?)
    }
}
