//! The heap consistency checker.
//!
//! Walks every block from the prologue to the sentinel, then every free list,
//! and reports the first broken invariant it finds. Reads that would fall
//! outside of the region are reported rather than panicking, so the checker
//! can be pointed at a heap that has already been corrupted.

use thiserror::Error;

use super::*;
use crate::{
    arena::PROLOGUE,
    block::{decode_link, DOUBLE_WORD_SIZE},
};

/// A violated heap invariant, found by [`Heap::check_invariants`].
///
/// Offsets are payload offsets from the start of the region unless noted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue block's header or footer was overwritten.
    #[error("malformed prologue: header {header:#x}, footer {footer:#x}")]
    BadPrologue {
        /// The raw header word.
        header: u64,
        /// The raw footer word.
        footer: u64,
    },

    /// A metadata word lies outside of the mapped region.
    #[error("block metadata at offset {offset:#x} lies outside of the region")]
    OutOfBounds {
        /// The offset of the word that could not be read.
        offset: usize,
    },

    /// A payload is not aligned to [`ALIGNMENT`].
    #[error("block at {offset:#x} is misaligned")]
    Misaligned {
        /// The block's payload offset.
        offset: usize,
    },

    /// A block's size is below the minimum or not a multiple of the
    /// alignment.
    #[error("block at {offset:#x} has invalid size {size}")]
    BadSize {
        /// The block's payload offset.
        offset: usize,
        /// The size recorded in the block's header.
        size: usize,
    },

    /// A free block's footer differs from its header.
    #[error("free block at {offset:#x} has header {header:#x} but footer {footer:#x}")]
    FooterMismatch {
        /// The block's payload offset.
        offset: usize,
        /// The raw header word.
        header: u64,
        /// The raw footer word.
        footer: u64,
    },

    /// A block's prev-allocated bit disagrees with its predecessor.
    #[error("block at {offset:#x} has a stale prev-allocated bit (recorded {recorded})")]
    PrevAllocatedMismatch {
        /// The payload offset of the block with the stale bit.
        offset: usize,
        /// What the stale bit says.
        recorded: bool,
    },

    /// Two free blocks are next to each other.
    #[error("free blocks at {first:#x} and {second:#x} were not coalesced")]
    Uncoalesced {
        /// The lower free block.
        first: usize,
        /// The higher free block.
        second: usize,
    },

    /// The block walk did not end at a sentinel on the last word of the
    /// region.
    #[error("arena ends at {offset:#x} with {tag:#x} instead of a sentinel at {expected:#x}")]
    BadSentinel {
        /// Where the walk stopped.
        offset: usize,
        /// The raw header word found there.
        tag: u64,
        /// Where the sentinel should be.
        expected: usize,
    },

    /// An allocated block, or something that is not a block, is in a free
    /// list.
    #[error("size class {class} links to {offset:#x}, which is not a free block")]
    NotFree {
        /// The size class whose list holds the bad entry.
        class: usize,
        /// The bad entry.
        offset: usize,
    },

    /// A free block is filed under the wrong size class.
    #[error("free block at {offset:#x} of size {size} is in size class {class}")]
    WrongClass {
        /// The block's payload offset.
        offset: usize,
        /// The block's size.
        size: usize,
        /// The class it was found in.
        class: usize,
    },

    /// A free list's back links do not mirror its forward links.
    #[error("free list link at {offset:#x} does not point back to its predecessor")]
    BrokenLink {
        /// The payload offset of the block with the wrong back link.
        offset: usize,
    },

    /// The free lists do not hold exactly the free blocks in the arena.
    #[error("arena has {in_arena} free blocks but the free lists hold {in_lists}")]
    FreeCountMismatch {
        /// Free blocks seen walking the arena.
        in_arena: usize,
        /// Entries seen walking the free lists.
        in_lists: usize,
    },
}

impl<R> Heap<R>
where
    R: Region,
{
    /// Check the heap's structural invariants.
    ///
    /// This walks the whole arena and every free list, so it is linear in the
    /// size of the heap. Enable the `debug_checks` cargo feature to run it
    /// after every operation.
    pub fn check_invariants(&self) -> Result<(), CheckError> {
        let free_in_arena = self.check_blocks()?;
        self.check_free_lists(free_in_arena)
    }

    fn word(&self, offset: usize) -> Result<u64, CheckError> {
        self.arena
            .try_read_word(offset)
            .ok_or(CheckError::OutOfBounds { offset })
    }

    /// Read the footer of a block claiming to be `size` bytes, without
    /// trusting `size` to keep the arithmetic in range.
    fn footer_word(&self, block: Payload, size: usize) -> Result<u64, CheckError> {
        let offset = block
            .offset()
            .checked_add(size)
            .and_then(|end| end.checked_sub(DOUBLE_WORD_SIZE))
            .ok_or(CheckError::OutOfBounds {
                offset: block.offset(),
            })?;
        self.word(offset)
    }

    fn link(&self, offset: usize) -> Result<Option<Payload>, CheckError> {
        Ok(decode_link(self.word(offset)?))
    }

    /// Walk the arena, returning the number of free blocks in it.
    fn check_blocks(&self) -> Result<usize, CheckError> {
        let prologue = Payload::new(PROLOGUE).unwrap_or_else(|| unreachable!());
        let header = self.word(prologue.header())?;
        let footer = self.footer_word(prologue, DOUBLE_WORD_SIZE)?;
        let expected = Tag::pack(DOUBLE_WORD_SIZE, true, true).word();
        if header != expected || footer != expected {
            return Err(CheckError::BadPrologue { header, footer });
        }

        let mut free_blocks = 0;
        let mut prev_allocated = true;
        let mut prev = prologue;
        let mut block = prologue.forward(DOUBLE_WORD_SIZE);
        loop {
            let offset = block.offset();
            let tag = Tag::from_word(self.word(block.header())?);

            if tag.is_prev_allocated() != prev_allocated {
                return Err(CheckError::PrevAllocatedMismatch {
                    offset,
                    recorded: tag.is_prev_allocated(),
                });
            }

            if tag.size() == 0 {
                let expected = self.arena.len();
                if !tag.is_allocated() || offset != expected {
                    return Err(CheckError::BadSentinel {
                        offset,
                        tag: tag.word(),
                        expected,
                    });
                }
                return Ok(free_blocks);
            }

            if offset % ALIGNMENT != 0 {
                return Err(CheckError::Misaligned { offset });
            }
            if tag.size() < MIN_BLOCK_SIZE || tag.size() % ALIGNMENT != 0 {
                return Err(CheckError::BadSize {
                    offset,
                    size: tag.size(),
                });
            }
            // The next header must still be inside the arena.
            match offset.checked_add(tag.size()) {
                Some(end) if end <= self.arena.len() => {}
                end => {
                    return Err(CheckError::OutOfBounds {
                        offset: end.map_or(usize::MAX, |end| end - WORD_SIZE),
                    })
                }
            }

            if !tag.is_allocated() {
                if !prev_allocated {
                    return Err(CheckError::Uncoalesced {
                        first: prev.offset(),
                        second: offset,
                    });
                }
                let footer = self.footer_word(block, tag.size())?;
                if footer != tag.word() {
                    return Err(CheckError::FooterMismatch {
                        offset,
                        header: tag.word(),
                        footer,
                    });
                }
                free_blocks += 1;
            }

            prev_allocated = tag.is_allocated();
            prev = block;
            block = block.forward(tag.size());
        }
    }

    /// Walk every free list. There must be exactly `free_in_arena` entries in
    /// total; the walk gives up once it has seen more, so a cycle cannot hang
    /// it.
    fn check_free_lists(&self, free_in_arena: usize) -> Result<(), CheckError> {
        let mut in_lists = 0;
        for class in 0..NUM_SIZE_CLASSES {
            let mut prev = None;
            let mut next = self.free_lists.head(class);
            while let Some(block) = next {
                in_lists += 1;
                if in_lists > free_in_arena {
                    return Err(CheckError::FreeCountMismatch {
                        in_arena: free_in_arena,
                        in_lists,
                    });
                }

                let offset = block.offset();
                let not_free = CheckError::NotFree { class, offset };
                if offset % ALIGNMENT != 0 || offset >= self.arena.len() {
                    return Err(not_free);
                }
                let tag = Tag::from_word(self.word(block.header())?);
                if tag.is_allocated() || tag.size() < MIN_BLOCK_SIZE {
                    return Err(not_free);
                }
                let footer = self.footer_word(block, tag.size())?;
                if footer != tag.word() {
                    return Err(CheckError::FooterMismatch {
                        offset,
                        header: tag.word(),
                        footer,
                    });
                }
                if size_class(tag.size()) != class {
                    return Err(CheckError::WrongClass {
                        offset,
                        size: tag.size(),
                        class,
                    });
                }
                if self.link(offset)? != prev {
                    return Err(CheckError::BrokenLink { offset });
                }

                prev = Some(block);
                next = self.link(offset + WORD_SIZE)?;
            }
        }

        if in_lists != free_in_arena {
            return Err(CheckError::FreeCountMismatch {
                in_arena: free_in_arena,
                in_lists,
            });
        }
        Ok(())
    }
}
