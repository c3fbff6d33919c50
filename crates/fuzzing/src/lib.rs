//! Shared fuzzing and testing infrastructure for `segfit`.

use allocator_api2::alloc::Global;
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use segfit::{AllocatorRegion, Heap, Payload, Region, ALIGNMENT};
use std::collections::BTreeMap;

/// The size of a test request, in bytes.
//
// Note: a newtype rather than a bare `usize` so that we can give it a default
// mutator that mostly picks small sizes, which is where the interesting block
// splitting and size-class boundaries are.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 1 << 14 }
    }
}

/// Sizes at and around the edges of the heap's size classes.
const INTERESTING_SIZES: &[usize] = &[
    0, 1, 8, 15, 16, 17, 24, 25, 40, 41, 56, 57, 120, 121, 248, 249, 1016, 1017, 4088, 4089, 8184,
    8185,
];

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        // Anywhere up to the maximum, or towards zero when shrinking.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Snap to a class boundary.
        if !c.shrink() {
            c.mutation(|ctx| {
                size.0 = *ctx.rng().choose(INTERESTING_SIZES).unwrap();
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Size> {
        if ctx.rng().gen_bool() {
            Ok(Size(*ctx.rng().choose(INTERESTING_SIZES).unwrap()))
        } else {
            Ok(Size(m::range(0..=self.max_size).generate(ctx)?))
        }
    }
}

/// A test operation.
#[derive(Clone, Debug, PartialEq, Eq, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Release { id: u32 },
    Realloc { id: u32, size: Size },
    ZeroAlloc { id: u32, count: u8, size: Size },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Release {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                let Size(size) = m::default::<Size>().generate(ctx)?;
                Ok(Op::ZeroAlloc {
                    id: ctx.rng().gen_u32(),
                    count: m::range(0..=16).generate(ctx)?,
                    size: Size(size / 16),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } | Op::ZeroAlloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::Release { id }
                    | Op::Realloc { id, .. }
                    | Op::ZeroAlloc { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Release an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let release_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(release_index, Op::Release { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let realloc_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(realloc_index, Op::Realloc { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// The growth chunk used by [`Ops::run`]. Deliberately small, so that even
/// short op sequences grow the arena several times.
const CHUNK_SIZE: usize = 256;

/// Fixed-width little-endian integers, so that byte-level mutations of an
/// encoded sequence map onto individual op fields.
const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Decode a sequence of operations from raw fuzzer input.
    pub fn decode(data: &[u8]) -> Option<Self> {
        bincode::decode_from_slice::<Ops, _>(data, bincode_config())
            .ok()
            .map(|(ops, _)| ops)
    }

    /// Encode these operations into `buf`, dropping operations off the end
    /// until the encoding fits. Returns the encoded length, or `None` if not
    /// even the empty sequence fits.
    pub fn encode_into(&mut self, buf: &mut [u8]) -> Option<usize> {
        loop {
            if let Ok(len) = bincode::encode_into_slice(&*self, &mut *buf, bincode_config()) {
                return Some(len);
            }
            if !self.pop() {
                return None;
            }
        }
    }

    /// Run these test operations against a fresh heap in a region of
    /// `capacity` bytes.
    pub fn run(&self, capacity: usize) -> Result<(), String> {
        let region = AllocatorRegion::new(Global, capacity)
            .map_err(|_| format!("failed to reserve a {capacity}-byte region"))?;
        let heap = Heap::with_chunk_size(region, CHUNK_SIZE)
            .map_err(|_| "failed to initialize the heap".to_string())?;
        self.run_with_heap(heap)
    }

    /// Run these test operations against the given heap.
    ///
    /// The heap should have no live allocations.
    pub fn run_with_heap<R>(&self, mut heap: Heap<R>) -> Result<(), String>
    where
        R: Region,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::default();

        // Assert that a live allocation's bytes still hold its pattern.
        let check_contents = |heap: &Heap<R>, id: u32, alloc: &LiveAlloc| -> Result<(), String> {
            let bytes = &heap.payload(alloc.payload)[..alloc.size];
            ensure!(
                bytes.iter().all(|b| *b == pattern(id)),
                "contents of id{id} ({alloc:?}) were clobbered",
            );
            Ok(())
        };

        // Release the allocation with the given id.
        let release = |heap: &mut Heap<R>, id: u32, alloc: LiveAlloc| -> Result<(), String> {
            check_contents(&*heap, id, &alloc)?;
            log::debug!("releasing id{id} -> {alloc:?}");
            heap.release(alloc.payload);
            Ok(())
        };

        // Assert that a new block is aligned, big enough, and not overlapping
        // any other live allocation.
        let check_new_block =
            |heap: &Heap<R>, live: &LiveMap, payload: Payload, size: usize| -> Result<(), String> {
                let start = payload.offset();
                let end = start + heap.usable_size(payload);
                ensure!(
                    start % ALIGNMENT == 0,
                    "payload offset {start:#x} is misaligned",
                );
                let address = heap.region().base().as_ptr() as usize + start;
                ensure!(
                    address % ALIGNMENT == 0,
                    "payload address {address:#x} is misaligned",
                );
                ensure!(
                    end - start >= size,
                    "usable size {} is less than the requested {size}",
                    end - start,
                );
                for other in live.map.values() {
                    let other_start = other.payload.offset();
                    let other_end = other_start + heap.usable_size(other.payload);
                    ensure!(
                        end <= other_start || other_end <= start,
                        "two distinct live allocations should never overlap",
                    );
                }
                Ok(())
            };

        // Take ownership of a new block under `id`, releasing whatever was
        // there before.
        let insert = |heap: &mut Heap<R>,
                      live: &mut LiveMap,
                      id: u32,
                      payload: Payload,
                      size: usize|
         -> Result<(), String> {
            if let Some(old) = live.map.remove(&id) {
                release(&mut *heap, id, old)?;
            }
            check_new_block(&*heap, &*live, payload, size)?;
            heap.payload_mut(payload).fill(pattern(id));
            log::debug!("new allocation: id{id} -> {payload:?} ({size} bytes)");
            live.map.insert(id, LiveAlloc { payload, size });
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size: Size(size) } => match heap.allocate(size) {
                    Ok(Some(payload)) => {
                        ensure!(size != 0, "zero-sized request got {payload:?}");
                        insert(&mut heap, &mut live, id, payload, size)?;
                    }
                    Ok(None) => ensure!(size == 0, "non-zero request of {size} bytes got nothing"),
                    Err(_) => log::debug!("out of memory"),
                },

                Op::Release { id } => {
                    if let Some(alloc) = live.map.remove(&id) {
                        release(&mut heap, id, alloc)?;
                    }
                }

                Op::Realloc { id, size: Size(size) } => {
                    let old = live.map.remove(&id);
                    let mut old_usable = 0;
                    if let Some(old) = &old {
                        check_contents(&heap, id, old)?;
                        old_usable = heap.usable_size(old.payload);
                    }
                    match heap.reallocate(old.as_ref().map(|a| a.payload), size) {
                        Ok(Some(payload)) => {
                            if let Some(old) = &old {
                                let kept = std::cmp::min(old.size, size);
                                ensure!(
                                    heap.payload(payload)[..kept]
                                        .iter()
                                        .all(|b| *b == pattern(id)),
                                    "reallocating id{id} did not preserve its first {kept} bytes",
                                );
                                if size <= old_usable {
                                    ensure!(
                                        payload == old.payload,
                                        "shrinking id{id} moved it",
                                    );
                                }
                            }
                            insert(&mut heap, &mut live, id, payload, size)?;
                        }
                        Ok(None) => ensure!(size == 0, "non-zero reallocation got nothing"),
                        Err(_) => {
                            log::debug!("out of memory");
                            // The old block must be untouched.
                            if let Some(old) = old {
                                check_contents(&heap, id, &old)?;
                                live.map.insert(id, old);
                            }
                        }
                    }
                }

                Op::ZeroAlloc { id, count, size: Size(size) } => {
                    match heap.zero_allocate(usize::from(count), size) {
                        Ok(Some(payload)) => {
                            ensure!(
                                heap.payload(payload).iter().all(|b| *b == 0),
                                "zero-allocated block contains a non-zero byte",
                            );
                            insert(&mut heap, &mut live, id, payload, usize::from(count) * size)?;
                        }
                        Ok(None) => ensure!(
                            count == 0 || size == 0,
                            "non-zero request got nothing"
                        ),
                        Err(_) => log::debug!("out of memory"),
                    }
                }
            }

            heap.check_invariants().map_err(|e| format!("after {op:?}: {e}"))?;
        }

        // Finally, release any remaining live allocations. Everything should
        // merge back into a single free block.
        for (id, alloc) in std::mem::take(&mut live.map) {
            release(&mut heap, id, alloc)?;
        }
        heap.check_invariants().map_err(|e| format!("after final release: {e}"))?;
        let blocks: Vec<_> = heap.blocks().collect();
        ensure!(
            blocks.len() == 1 && !blocks[0].allocated,
            "releasing everything should leave one free block, found {blocks:?}",
        );

        Ok(())
    }
}

/// The byte a live allocation is filled with, so that a write through an
/// overlapping block, or a bad copy, shows up as the wrong byte.
fn pattern(id: u32) -> u8 {
    (id % 0xFF) as u8 + 1
}

/// A currently-live allocation.
#[derive(Debug)]
struct LiveAlloc {
    payload: Payload,
    /// Requested size at allocation time.
    size: usize,
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,
}
