//! Shared fixtures for the integration tests.
//!
//! Heaps are built small and with the static heuristic at a zero trigger
//! threshold, so collections only happen when a test asks for them (or when
//! an allocation genuinely fails). Tests that build a whole heap take the
//! serial lock: each heap spawns its own GC threads and maps real memory.

use std::sync::Arc;

use veldt::util::options::Options;
use veldt::Heap;

pub const REGION: usize = 128 * 1024;

pub fn options(extra: &str) -> Options {
    let mut options = Options::default();
    assert!(options.set_bulk_from_command_line(
        "heap_size=33554432 region_size=131072 threads=2 heuristics=Static \
         min_free_threshold_percent=0 uncommit=false verify_after_gc=true"
    ));
    if !extra.is_empty() {
        assert!(options.set_bulk_from_command_line(extra), "bad test options: {}", extra);
    }
    options
}

pub fn heap(extra: &str) -> Arc<Heap> {
    Heap::new(options(extra))
}

/// Allocate a chain of `count` regular objects, each holding a payload tag
/// and a reference to the previous one. Returns the head (last allocated).
pub fn alloc_chain(
    mutator: &veldt::Mutator,
    count: usize,
    payload_words: usize,
) -> veldt::ObjectReference {
    let mut prev: Option<veldt::ObjectReference> = None;
    for i in 0..count {
        let obj = mutator
            .alloc(1, payload_words, veldt::ObjectKind::Regular)
            .expect("test heap exhausted");
        unsafe { mutator.payload_addr(obj).store::<usize>(i) };
        mutator.store_ref(obj, 0, prev);
        prev = Some(obj);
    }
    prev.unwrap()
}

/// Walk a chain built by [`alloc_chain`], checking payload tags. Returns the
/// number of objects seen.
pub fn check_chain(mutator: &veldt::Mutator, head: veldt::ObjectReference) -> usize {
    let mut seen = 0;
    let mut cursor = Some(head);
    let mut expected: Option<usize> = None;
    while let Some(obj) = cursor {
        let tag = unsafe { mutator.payload_addr(obj).load::<usize>() };
        if let Some(expected) = expected {
            assert_eq!(tag, expected, "chain payload corrupted");
        }
        expected = tag.checked_sub(1);
        seen += 1;
        cursor = mutator.load_ref(obj, 0);
    }
    seen
}
