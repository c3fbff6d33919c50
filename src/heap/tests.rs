use super::*;
use std::{vec, vec::Vec};

const MEGABYTE: usize = 1 << 20;

fn layout<R: Region>(heap: &Heap<R>) -> Vec<(usize, usize, bool)> {
    heap.blocks()
        .map(|b| (b.payload.offset(), b.size, b.allocated))
        .collect()
}

fn alloc<R: Region>(heap: &mut Heap<R>, size: usize) -> Payload {
    heap.allocate(size)
        .expect("allocation should succeed")
        .expect("non-zero size should allocate")
}

#[test]
fn fresh_heap_is_one_free_chunk() {
    let _ = env_logger::try_init();
    let mut memory = vec![0u8; MEGABYTE];
    let heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();

    assert_eq!(layout(&heap), [(32, DEFAULT_CHUNK_SIZE, false)]);
    assert_eq!(heap.region().len(), 32 + DEFAULT_CHUNK_SIZE);
    assert_eq!(heap.region().base().as_ptr() as usize % ALIGNMENT, 0);
    assert_eq!(heap.check_invariants(), Ok(()));
}

#[test]
fn chunk_size_is_rounded() {
    let mut memory = vec![0u8; MEGABYTE];
    let heap = Heap::with_chunk_size(SliceRegion::new(&mut memory), 1).unwrap();
    assert_eq!(heap.chunk_size(), MIN_BLOCK_SIZE);
    let region = heap.destroy();
    let heap = Heap::with_chunk_size(region, 33).unwrap();
    assert_eq!(heap.chunk_size(), 48);
    assert_eq!(layout(&heap), [(32, 48, false)]);
}

#[test]
fn first_fit_reuses_released_block_then_merges_back() {
    let _ = env_logger::try_init();
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let initial = layout(&heap);

    let a = alloc(&mut heap, 40);
    let b = alloc(&mut heap, 40);
    heap.release(a);
    let c = alloc(&mut heap, 40);
    assert_eq!(c, a);
    assert_eq!(heap.check_invariants(), Ok(()));

    heap.release(b);
    heap.release(c);
    assert_eq!(heap.check_invariants(), Ok(()));
    assert_eq!(layout(&heap), initial);
    for class in 0..NUM_SIZE_CLASSES {
        let expected: &[Payload] = if class == size_class(DEFAULT_CHUNK_SIZE) { &[a] } else { &[] };
        assert_eq!(heap.free_blocks(class).collect::<Vec<_>>(), expected);
    }
}

#[test]
fn large_requests_use_the_last_class() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();

    let a = alloc(&mut heap, 5000);
    let b = alloc(&mut heap, 9000);
    assert_eq!(size_class(heap.usable_size(a) + WORD_SIZE), 7);
    assert_eq!(size_class(heap.usable_size(b) + WORD_SIZE), NUM_SIZE_CLASSES - 1);
    assert!(b.offset() >= a.offset() + heap.usable_size(a));

    // A free block from the smaller class is never handed to the larger
    // request, even if it is the most recently released one.
    heap.release(a);
    assert_eq!(heap.free_blocks(7).collect::<Vec<_>>(), [a]);
    let c = alloc(&mut heap, 9000);
    assert_ne!(c, a);
    assert_eq!(heap.free_blocks(7).collect::<Vec<_>>(), [a]);
    assert_eq!(heap.check_invariants(), Ok(()));
}

#[test]
fn releasing_neighbors_in_either_order_coalesces() {
    for reversed in [false, true] {
        let mut memory = vec![0u8; MEGABYTE];
        let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
        let a = alloc(&mut heap, 100);
        let b = alloc(&mut heap, 100);
        let _guard = alloc(&mut heap, 100);
        let combined = heap.usable_size(a) + heap.usable_size(b) + WORD_SIZE;

        if reversed {
            heap.release(b);
            heap.release(a);
        } else {
            heap.release(a);
            heap.release(b);
        }
        assert_eq!(heap.check_invariants(), Ok(()));
        assert_eq!(layout(&heap)[0], (a.offset(), 224, false));

        let len = heap.region().len();
        let merged = alloc(&mut heap, combined);
        assert_eq!(merged, a);
        assert_eq!(heap.usable_size(merged), combined);
        assert_eq!(heap.region().len(), len, "no growth needed");
    }
}

#[test]
fn coalescing_cases() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let x: Vec<Payload> = (0..6).map(|_| alloc(&mut heap, 100)).collect();
    let at = |i: usize| x[i].offset();
    let tail = at(5) + 112;
    let tail_size = DEFAULT_CHUNK_SIZE - 6 * 112;
    assert_eq!(layout(&heap)[6], (tail, tail_size, false));

    // Both neighbors allocated.
    heap.release(x[1]);
    assert_eq!(layout(&heap)[1], (at(1), 112, false));
    assert_eq!(heap.check_invariants(), Ok(()));

    // Previous free, next allocated.
    heap.release(x[2]);
    assert_eq!(layout(&heap)[1], (at(1), 224, false));
    assert_eq!(layout(&heap)[2], (at(3), 112, true));
    assert_eq!(heap.check_invariants(), Ok(()));

    // Both free.
    heap.release(x[4]);
    heap.release(x[3]);
    assert_eq!(layout(&heap)[1], (at(1), 448, false));
    assert_eq!(heap.check_invariants(), Ok(()));

    // Both free, merging into the tail.
    heap.release(x[5]);
    assert_eq!(
        layout(&heap),
        [(at(0), 112, true), (at(1), DEFAULT_CHUNK_SIZE - 112, false)]
    );
    assert_eq!(heap.check_invariants(), Ok(()));

    // Previous allocated, next free.
    heap.release(x[0]);
    assert_eq!(layout(&heap), [(at(0), DEFAULT_CHUNK_SIZE, false)]);
    assert_eq!(heap.check_invariants(), Ok(()));
}

#[test]
fn growth_merges_with_trailing_free_block() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::with_chunk_size(SliceRegion::new(&mut memory), 64).unwrap();
    assert_eq!(layout(&heap), [(32, 64, false)]);

    let p = alloc(&mut heap, 100);
    assert_eq!(p.offset(), 32);
    assert_eq!(layout(&heap), [(32, 112, true), (144, 64, false)]);
    assert_eq!(heap.region().len(), 32 + 64 + 112);
    assert_eq!(heap.check_invariants(), Ok(()));
}

#[test]
fn allocations_are_aligned_and_disjoint() {
    let mut memory = vec![0u8; 4 * MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let sizes = [
        1, 7, 16, 17, 24, 25, 32, 40, 48, 60, 100, 255, 256, 1000, 4000, 5000, 9000, 20000,
    ];

    let mut live: Vec<(Payload, usize)> = Vec::new();
    for round in 0..3 {
        for &size in &sizes {
            let p = alloc(&mut heap, size);
            assert_eq!(p.offset() % ALIGNMENT, 0);
            let address = heap.region().base().as_ptr() as usize + p.offset();
            assert_eq!(address % ALIGNMENT, 0);
            assert!(heap.usable_size(p) >= size);
            heap.payload_mut(p).fill(size as u8);
            live.push((p, size));
        }

        // Release every other allocation to exercise reuse in the next round.
        let mut i = round % 2;
        while i < live.len() {
            let (p, _) = live.remove(i);
            heap.release(p);
            i += 1;
        }
        assert_eq!(heap.check_invariants(), Ok(()));
    }

    for (i, (p, _)) in live.iter().enumerate() {
        let start = p.offset();
        let end = start + heap.usable_size(*p);
        for (q, _) in &live[i + 1..] {
            let other_start = q.offset();
            let other_end = other_start + heap.usable_size(*q);
            assert!(end <= other_start || other_end <= start, "{p:?} overlaps {q:?}");
        }
    }
    for (p, size) in &live {
        assert!(heap.payload(*p).iter().all(|b| *b == *size as u8));
    }
}

#[test]
fn grow_preserves_contents() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let p = alloc(&mut heap, 40);
    for (i, b) in heap.payload_mut(p).iter_mut().enumerate() {
        *b = i as u8;
    }
    let _guard = alloc(&mut heap, 40);

    let q = heap.reallocate(Some(p), 1000).unwrap().unwrap();
    assert_ne!(q, p);
    assert!(heap.usable_size(q) >= 1000);
    assert!(heap.payload(q)[..40].iter().enumerate().all(|(i, b)| *b == i as u8));
    assert_eq!(heap.check_invariants(), Ok(()));

    // The old block went back to the free lists.
    assert!(heap.blocks().any(|b| b.payload == p && !b.allocated));
}

#[test]
fn shrink_in_place_merges_remainder_forward() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let p = alloc(&mut heap, 1000);
    heap.payload_mut(p).fill(0x5A);

    let q = heap.reallocate(Some(p), 100).unwrap().unwrap();
    assert_eq!(q, p);
    assert_eq!(heap.usable_size(p), 104);
    assert!(heap.payload(p).iter().all(|b| *b == 0x5A));
    assert_eq!(
        layout(&heap),
        [(32, 112, true), (144, DEFAULT_CHUNK_SIZE - 112, false)]
    );
    assert_eq!(heap.check_invariants(), Ok(()));
}

#[test]
fn shrink_in_place_next_to_allocated_block() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let p = alloc(&mut heap, 1000);
    let guard = alloc(&mut heap, 10);

    assert_eq!(heap.reallocate(Some(p), 100), Ok(Some(p)));
    assert_eq!(layout(&heap)[..3], [(32, 112, true), (144, 896, false), (guard.offset(), 32, true)]);
    assert_eq!(heap.check_invariants(), Ok(()));

    // Too little left over to split: the block keeps its size.
    let before = heap.usable_size(p);
    assert_eq!(heap.reallocate(Some(p), 90), Ok(Some(p)));
    assert_eq!(heap.usable_size(p), before);
    assert_eq!(heap.check_invariants(), Ok(()));
}

#[test]
fn reallocate_to_current_size_is_a_no_op() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let p = alloc(&mut heap, 77);
    heap.payload_mut(p).fill(7);
    let before = layout(&heap);

    let usable = heap.usable_size(p);
    assert_eq!(heap.reallocate(Some(p), usable), Ok(Some(p)));
    assert_eq!(layout(&heap), before);
    assert!(heap.payload(p).iter().all(|b| *b == 7));
}

#[test]
fn null_and_zero_edge_cases() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let mut other_memory = vec![0u8; MEGABYTE];
    let mut other = Heap::new(SliceRegion::new(&mut other_memory)).unwrap();

    assert_eq!(heap.allocate(0), Ok(None));
    assert_eq!(heap.reallocate(None, 0), Ok(None));
    assert_eq!(heap.zero_allocate(0, 16), Ok(None));

    let p = heap.reallocate(None, 40).unwrap().unwrap();
    let q = alloc(&mut other, 40);
    assert_eq!(p, q);
    assert_eq!(layout(&heap), layout(&other));

    assert_eq!(heap.reallocate(Some(p), 0), Ok(None));
    assert_eq!(layout(&heap), [(32, DEFAULT_CHUNK_SIZE, false)]);
    assert_eq!(heap.check_invariants(), Ok(()));
}

#[test]
fn zero_allocate_clears_reused_memory() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let p = alloc(&mut heap, 64);
    heap.payload_mut(p).fill(0xFF);
    heap.release(p);

    let z = heap.zero_allocate(8, 8).unwrap().unwrap();
    assert_eq!(z, p);
    assert!(heap.usable_size(z) >= 64);
    assert!(heap.payload(z).iter().all(|b| *b == 0));
}

#[test]
fn zero_allocate_overflow_is_out_of_memory() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut heap = Heap::new(SliceRegion::new(&mut memory)).unwrap();
    let before = layout(&heap);
    assert_eq!(heap.zero_allocate(usize::MAX, 2), Err(AllocError));
    assert_eq!(heap.allocate(usize::MAX), Err(AllocError));
    assert_eq!(layout(&heap), before);
}

#[test]
fn out_of_memory_leaves_heap_usable() {
    let mut memory = vec![0u8; 8192];
    let mut heap = Heap::with_chunk_size(SliceRegion::new(&mut memory), 1024).unwrap();
    let p = alloc(&mut heap, 100);
    heap.payload_mut(p).fill(0x11);
    let len = heap.region().len();

    assert_eq!(heap.allocate(MEGABYTE), Err(AllocError));
    assert_eq!(heap.region().len(), len);
    assert_eq!(heap.check_invariants(), Ok(()));

    // A failed move leaves the original block where it was.
    assert_eq!(heap.reallocate(Some(p), MEGABYTE), Err(AllocError));
    assert!(heap.payload(p).iter().all(|b| *b == 0x11));
    assert_eq!(heap.check_invariants(), Ok(()));

    let q = alloc(&mut heap, 100);
    assert_ne!(p, q);
    heap.release(p);
    heap.release(q);
    assert_eq!(layout(&heap), [(32, 1024, false)]);
}

#[test]
fn destroy_and_reinitialize() {
    let mut memory = vec![0u8; MEGABYTE];
    let mut region = SliceRegion::new(&mut memory);
    for _ in 0..3 {
        let mut heap = Heap::new(region).unwrap();
        assert_eq!(layout(&heap), [(32, DEFAULT_CHUNK_SIZE, false)]);
        let _ = alloc(&mut heap, 10_000);
        let _ = alloc(&mut heap, 10);
        assert_eq!(heap.check_invariants(), Ok(()));
        region = heap.destroy();
        assert!(region.is_empty());
    }
}
