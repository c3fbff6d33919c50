//! Word-level access to a heap's region.
//!
//! The arena is the region viewed as a sequence of blocks. All reads and
//! writes go through offsets that are bounds-checked against the region's
//! current length; a block computation that strays outside the region panics
//! instead of touching memory it does not own.

use super::*;
use crate::block::{decode_link, encode_link, Tag, DOUBLE_WORD_SIZE};

/// Offset of the prologue's payload. The prologue is a permanently allocated,
/// minimum-aligned block that sits below every real block.
pub(crate) const PROLOGUE: usize = DOUBLE_WORD_SIZE;

/// Bytes written by `format`: one padding word, the prologue's header and
/// footer, and the initial sentinel header.
pub(crate) const PROLOGUE_REGION_SIZE: usize = 4 * WORD_SIZE;

pub(crate) struct Arena<R> {
    region: R,
}

impl<R> Arena<R>
where
    R: Region,
{
    pub(crate) fn new(region: R) -> Self {
        Arena { region }
    }

    #[inline]
    pub(crate) fn region(&self) -> &R {
        &self.region
    }

    #[inline]
    pub(crate) fn into_region(self) -> R {
        self.region
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub(crate) fn read_word(&self, offset: usize) -> u64 {
        let mut word = [0; WORD_SIZE];
        word.copy_from_slice(&self.region.as_slice()[offset..offset + WORD_SIZE]);
        u64::from_ne_bytes(word)
    }

    /// Like `read_word` but reports out-of-bounds offsets instead of
    /// panicking.
    #[inline]
    pub(crate) fn try_read_word(&self, offset: usize) -> Option<u64> {
        let bytes = self
            .region
            .as_slice()
            .get(offset..offset.checked_add(WORD_SIZE)?)?;
        let mut word = [0; WORD_SIZE];
        word.copy_from_slice(bytes);
        Some(u64::from_ne_bytes(word))
    }

    #[inline]
    pub(crate) fn write_word(&mut self, offset: usize, word: u64) {
        self.region.as_mut_slice()[offset..offset + WORD_SIZE].copy_from_slice(&word.to_ne_bytes());
    }

    #[inline]
    pub(crate) fn header(&self, block: Payload) -> Tag {
        Tag::from_word(self.read_word(block.header()))
    }

    #[inline]
    pub(crate) fn set_header(&mut self, block: Payload, tag: Tag) {
        self.write_word(block.header(), tag.word());
    }

    /// The footer of a free block, located through its header's size.
    #[cfg(test)]
    pub(crate) fn footer(&self, block: Payload) -> Tag {
        let size = self.header(block).size();
        Tag::from_word(self.read_word(block.footer(size)))
    }

    /// Write `tag` as both header and footer of `block`, sized by `tag`.
    #[inline]
    pub(crate) fn set_boundary_tags(&mut self, block: Payload, tag: Tag) {
        self.write_word(block.header(), tag.word());
        self.write_word(block.footer(tag.size()), tag.word());
    }

    /// Update only the prev-allocated bit of `block`'s header.
    ///
    /// Callers only use this on allocated blocks and the sentinel, which have
    /// no footer to keep in sync.
    #[inline]
    pub(crate) fn set_prev_allocated(&mut self, block: Payload, prev_allocated: bool) {
        let tag = self.header(block);
        debug_assert!(tag.is_allocated(), "{block:?} is free: {tag:?}");
        self.set_header(block, tag.with_prev_allocated(prev_allocated));
    }

    #[inline]
    pub(crate) fn next_block(&self, block: Payload) -> Payload {
        block.forward(self.header(block).size())
    }

    /// The block before `block`, found through its footer. Only meaningful
    /// when that block is free.
    #[inline]
    pub(crate) fn prev_block(&self, block: Payload) -> Payload {
        debug_assert!(!self.header(block).is_prev_allocated());
        let prev_size = Tag::from_word(self.read_word(block.offset() - DOUBLE_WORD_SIZE)).size();
        block.back(prev_size)
    }

    /// The sentinel at the end of the arena. Its "payload" is the end of the
    /// region; only its header is mapped.
    #[inline]
    pub(crate) fn sentinel(&self) -> Payload {
        Payload::new(self.len()).unwrap_or_else(|| panic!("arena is not formatted"))
    }

    #[inline]
    pub(crate) fn link_prev(&self, block: Payload) -> Option<Payload> {
        decode_link(self.read_word(block.offset()))
    }

    #[inline]
    pub(crate) fn link_next(&self, block: Payload) -> Option<Payload> {
        decode_link(self.read_word(block.offset() + WORD_SIZE))
    }

    #[inline]
    pub(crate) fn set_link_prev(&mut self, block: Payload, prev: Option<Payload>) {
        self.write_word(block.offset(), encode_link(prev));
    }

    #[inline]
    pub(crate) fn set_link_next(&mut self, block: Payload, next: Option<Payload>) {
        self.write_word(block.offset() + WORD_SIZE, encode_link(next));
    }

    /// The `len` bytes starting at `block`'s payload.
    #[inline]
    pub(crate) fn bytes(&self, block: Payload, len: usize) -> &[u8] {
        &self.region.as_slice()[block.offset()..block.offset() + len]
    }

    #[inline]
    pub(crate) fn bytes_mut(&mut self, block: Payload, len: usize) -> &mut [u8] {
        &mut self.region.as_mut_slice()[block.offset()..block.offset() + len]
    }

    /// Copy `len` payload bytes from `src` to `dst`.
    #[inline]
    pub(crate) fn copy(&mut self, src: Payload, dst: Payload, len: usize) {
        self.region
            .as_mut_slice()
            .copy_within(src.offset()..src.offset() + len, dst.offset());
    }

    /// Reset the region and lay down the padding word, the prologue, and the
    /// sentinel.
    pub(crate) fn format(&mut self) -> Result<(), AllocError> {
        self.region.reset();
        let start = self.region.grow(PROLOGUE_REGION_SIZE)?;
        debug_assert_eq!(start, 0);

        let prologue = Tag::pack(DOUBLE_WORD_SIZE, true, true);
        self.write_word(0, 0);
        self.write_word(WORD_SIZE, prologue.word());
        self.write_word(2 * WORD_SIZE, prologue.word());
        self.write_word(3 * WORD_SIZE, Tag::pack(0, true, true).word());
        Ok(())
    }

    /// Grow the arena by at least `words` words (rounded up to an even count)
    /// and format the new space as one free block followed by a fresh
    /// sentinel.
    ///
    /// The new block takes over the old sentinel's header, so its
    /// prev-allocated bit is whatever the old sentinel recorded. The block is
    /// not filed in any free list yet; the caller hands it to the coalescer.
    pub(crate) fn extend(&mut self, words: usize) -> Result<Payload, AllocError> {
        let words = words.checked_add(words % 2).ok_or(AllocError)?;
        let size = words.checked_mul(WORD_SIZE).ok_or(AllocError)?;

        let old_sentinel = self.sentinel();
        let prev_allocated = self.header(old_sentinel).is_prev_allocated();

        let start = self.region.grow(size)?;
        debug_assert_eq!(start, old_sentinel.offset());
        log::debug!("grew arena by {size} bytes at offset {start:#x}");

        let block = old_sentinel;
        self.set_boundary_tags(block, Tag::pack(size, false, prev_allocated));
        let sentinel = self.next_block(block);
        debug_assert_eq!(sentinel, self.sentinel());
        self.set_header(sentinel, Tag::pack(0, true, false));
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    #[test]
    fn format_lays_down_prologue_and_sentinel() {
        let mut memory = vec![0xFFu8; 256];
        let mut arena = Arena::new(SliceRegion::new(&mut memory));
        arena.format().unwrap();

        assert_eq!(arena.len(), PROLOGUE_REGION_SIZE);
        let prologue = Payload::new(PROLOGUE).unwrap();
        assert_eq!(arena.header(prologue), Tag::pack(16, true, true));
        assert_eq!(arena.footer(prologue), arena.header(prologue));
        assert_eq!(arena.next_block(prologue), arena.sentinel());
        assert_eq!(arena.header(arena.sentinel()), Tag::pack(0, true, true));
    }

    #[test]
    fn extend_replaces_the_sentinel() {
        let mut memory = vec![0u8; 256];
        let mut arena = Arena::new(SliceRegion::new(&mut memory));
        arena.format().unwrap();

        // Odd word counts are rounded up to keep the double-word alignment.
        let block = arena.extend(5).unwrap();
        assert_eq!(block.offset(), PROLOGUE_REGION_SIZE);
        assert_eq!(arena.len(), PROLOGUE_REGION_SIZE + 48);
        assert_eq!(arena.header(block), Tag::pack(48, false, true));
        assert_eq!(arena.footer(block), arena.header(block));
        assert_eq!(arena.next_block(block), arena.sentinel());
        assert_eq!(arena.header(arena.sentinel()), Tag::pack(0, true, false));
    }

    #[test]
    fn extend_failure_leaves_the_arena_alone() {
        let mut memory = vec![0u8; 128];
        let mut arena = Arena::new(SliceRegion::new(&mut memory));
        arena.format().unwrap();
        let before = arena.len();
        assert_eq!(arena.extend(1 << 20), Err(AllocError));
        assert_eq!(arena.len(), before);
        assert_eq!(arena.header(arena.sentinel()), Tag::pack(0, true, true));
    }

    #[test]
    fn links_live_in_the_payload() {
        let mut memory = vec![0u8; 256];
        let mut arena = Arena::new(SliceRegion::new(&mut memory));
        arena.format().unwrap();
        let block = arena.extend(4).unwrap();
        let other = Payload::new(0x80).unwrap();

        arena.set_link_prev(block, None);
        arena.set_link_next(block, Some(other));
        assert_eq!(arena.link_prev(block), None);
        assert_eq!(arena.link_next(block), Some(other));
        assert_eq!(arena.read_word(block.offset() + WORD_SIZE), 0x80);
    }

    #[test]
    fn out_of_bounds_reads_are_reported() {
        let mut memory = vec![0u8; 128];
        let mut arena = Arena::new(SliceRegion::new(&mut memory));
        arena.format().unwrap();
        assert_eq!(arena.try_read_word(arena.len()), None);
        assert_eq!(arena.try_read_word(usize::MAX - 2), None);
        assert!(arena.try_read_word(arena.len() - WORD_SIZE).is_some());
    }
}
