//! A heap behind a lock, and the guard that hands out pointers into it.
//!
//! The lock is pluggable through [`Lock`] so the crate stays `no_std`. The
//! guard is where pointers and payload offsets meet: everything the
//! `Allocator` impl hands out or takes back is translated against the locked
//! heap's region base here.

use core::{
    cell::{Cell, UnsafeCell},
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use super::*;

/// Mutual exclusion for the heap inside a [`SegFitAllocator`].
///
/// # Safety
///
/// * If the implementation type is `Sync`, the allocator using it is `Sync`
///   too, so `lock` must keep every other thread out until `unlock`.
///
/// * `lock` must never succeed while the lock is already held, even on the
///   same thread. Re-entering the heap from inside one of its own operations
///   would see its bookkeeping half-updated.
pub unsafe trait Lock {
    /// Take the lock, or panic, abort, or wait forever if that is impossible.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A [`Lock`] for allocators that are never shared between threads.
///
/// Panics if the heap is re-entered while an operation on it is in progress.
#[derive(Debug, Default)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

impl SingleThreadedLock {
    /// Construct a new, unlocked `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.replace(true), "heap re-entered while locked");
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.locked.get());
        self.locked.set(false);
    }
}

/// A test-and-test-and-set spin [`Lock`], for sharing an allocator between
/// threads without an operating system.
///
/// Re-entering the heap from the thread that holds the lock spins forever.
#[derive(Debug, Default)]
pub struct SpinLock {
    held: AtomicBool,
}

impl SpinLock {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            held: AtomicBool::new(false),
        }
    }
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

pub(super) struct LockedHeap<R, L>
where
    R: Region,
{
    lock: L,
    heap: UnsafeCell<Heap<R>>,
}

// Safety: the heap owns its region outright, so moving the pair moves the only
// handle to the arena.
unsafe impl<R, L> Send for LockedHeap<R, L>
where
    R: Region + Send,
    L: Send,
{
}

// Safety: every shared access goes through `lock`, which `Lock`'s contract
// makes exclusive whenever `L` is `Sync`. A guard can move the heap's contents
// around between threads, hence `R: Send`.
unsafe impl<R, L> Sync for LockedHeap<R, L>
where
    R: Region + Send,
    L: Lock + Sync,
{
}

impl<R, L> LockedHeap<R, L>
where
    R: Region,
    L: Lock,
{
    pub(super) const fn new(heap: Heap<R>, lock: L) -> Self {
        LockedHeap {
            lock,
            heap: UnsafeCell::new(heap),
        }
    }

    pub(super) fn lock(&self) -> HeapGuard<'_, R, L> {
        self.lock.lock();
        HeapGuard { locked: self }
    }

    #[inline]
    pub(super) fn get_mut(&mut self) -> &mut Heap<R> {
        self.heap.get_mut()
    }

    #[inline]
    pub(super) fn into_inner(self) -> Heap<R> {
        self.heap.into_inner()
    }
}

/// Exclusive access to a locked heap, released on drop.
pub(super) struct HeapGuard<'a, R, L>
where
    R: Region,
    L: Lock,
{
    locked: &'a LockedHeap<R, L>,
}

impl<R, L> HeapGuard<'_, R, L>
where
    R: Region,
    L: Lock,
{
    /// The payload a pointer from [`block`][Self::block] refers to.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` lies below the region's base plus the prologue, and,
    /// with debug assertions, if it lies past the arena's end.
    pub(super) fn payload_of(&self, ptr: NonNull<u8>) -> Payload {
        let base = self.region().base().as_ptr() as usize;
        let offset = (ptr.as_ptr() as usize).wrapping_sub(base);
        debug_assert!(offset < self.region().len(), "{ptr:p} is not from this heap");
        Payload::new(offset).unwrap_or_else(|| panic!("{ptr:p} is not a payload pointer"))
    }

    /// The whole usable extent of a live allocation, as a raw slice.
    pub(super) fn block(&self, payload: Payload) -> NonNull<[u8]> {
        let len = self.usable_size(payload);
        // Safety: a live payload lies inside the region's mapped bytes, which
        // start at the non-null base.
        let ptr = unsafe { self.region().base().add(payload.offset()) };
        NonNull::slice_from_raw_parts(ptr, len)
    }

    /// Like [`block`][Self::block] for an optional payload, where no payload
    /// is the empty slice.
    pub(super) fn block_or_empty(&self, payload: Option<Payload>) -> NonNull<[u8]> {
        match payload {
            Some(payload) => self.block(payload),
            None => NonNull::slice_from_raw_parts(dangling(), 0),
        }
    }
}

impl<R, L> Drop for HeapGuard<'_, R, L>
where
    R: Region,
    L: Lock,
{
    fn drop(&mut self) {
        self.locked.lock.unlock();
    }
}

impl<R, L> Deref for HeapGuard<'_, R, L>
where
    R: Region,
    L: Lock,
{
    type Target = Heap<R>;

    #[inline]
    fn deref(&self) -> &Heap<R> {
        // Safety: the guard holds the lock.
        unsafe { &*self.locked.heap.get() }
    }
}

impl<R, L> DerefMut for HeapGuard<'_, R, L>
where
    R: Region,
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Heap<R> {
        // Safety: the guard holds the lock, and `&mut self` keeps this the
        // only reference derived from it.
        unsafe { &mut *self.locked.heap.get() }
    }
}
