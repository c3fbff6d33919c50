#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use segfit_fuzzing::Ops;

/// Room for every op sequence the mutator produces.
const ROOMY_REGION: usize = 1 << 20;

/// Small enough that most sequences exhaust it, so the heap's out-of-memory
/// paths run against the same ops.
const TIGHT_REGION: usize = 1 << 12;

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Leave one in eight inputs to libFuzzer's byte-level mutations.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = Ops::decode(&data[..size]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_ok() {
        if let Some(len) = ops.encode_into(&mut data[..max_size]) {
            return len;
        }
    }
    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(ops) = Ops::decode(data) else {
        return;
    };
    for capacity in [ROOMY_REGION, TIGHT_REGION] {
        if let Err(e) = ops.run(capacity) {
            panic!("error in a {capacity}-byte region: {e}");
        }
    }
});
