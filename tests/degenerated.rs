mod common;

use veldt::gc::degenerated::DegeneratedGc;
use veldt::gc::verify::verify_at_safepoint;
use veldt::gc::{DegenPoint, GcCause};
use veldt::generation::GenerationKind;
use veldt::util::test_util::with_serial_lock;
use veldt::ObjectKind;

/// A degenerated cycle run from outside any cycle does a whole collection
/// under STW and restores every invariant.
#[test]
fn degenerated_cycle_from_outside_collects_garbage() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        let head = common::alloc_chain(&mutator, 100, 16);
        let root = mutator.add_root(head);
        for _ in 0..1000 {
            let _ = mutator.alloc(0, 100, ObjectKind::Regular).unwrap();
        }

        let used_before = heap.young_generation().used();
        mutator.park();
        let gc = DegeneratedGc::new(&heap, GenerationKind::Young, DegenPoint::OutsideCycle);
        let outcome = gc.collect(GcCause::AllocFailure);
        verify_at_safepoint(&heap, "after direct degenerated GC");
        mutator.unpark();

        assert!(outcome.progress, "garbage was there to reclaim");
        assert!(!outcome.upgraded_to_full);
        assert!(heap.young_generation().used() < used_before);

        let head = mutator.get_root(root);
        assert_eq!(common::check_chain(&mutator, head), 100);

        drop(mutator);
        heap.shutdown();
    });
}

/// Allocation failure with a fully live heap: the controller services the
/// failure (degenerated, upgrading to full when futile), the stalled
/// allocation eventually gives up, and the heap stays consistent. Once the
/// data is dropped, allocation succeeds again.
#[test]
fn allocation_failure_degenerates_then_recovers() {
    with_serial_lock(|| {
        // Small heap so it fills quickly.
        let heap = common::heap("heap_size=4194304");
        let mutator = heap.attach_mutator();

        // Fill until allocation fails for good.
        let mut roots = Vec::new();
        loop {
            match mutator.alloc(0, 1000, ObjectKind::Regular) {
                Some(obj) => roots.push(mutator.add_root(obj)),
                None => break,
            }
            assert!(roots.len() < 10_000, "allocation never failed");
        }

        // The failure path ran at least one STW collection.
        assert!(
            heap.policy().alloc_failure_degenerated_count() > 0
                || heap.policy().alloc_failure_full_count() > 0,
            "allocation failure must have been serviced by a STW collection"
        );

        mutator.park();
        verify_at_safepoint(&heap, "after exhausted heap");
        mutator.unpark();

        // Dropping the data lets the next failure-driven collection reclaim
        // everything.
        mutator.clear_roots();
        let obj = mutator.alloc(0, 1000, ObjectKind::Regular);
        assert!(obj.is_some(), "allocation must succeed after garbage is dropped");

        drop(mutator);
        heap.shutdown();
    });
}

/// The futility upgrade: consecutive no-progress degenerated cycles push
/// `should_upgrade_degenerated_gc` over the configured threshold, and the
/// next failure runs a full GC.
#[test]
fn no_progress_streak_upgrades_to_full() {
    with_serial_lock(|| {
        let heap = common::heap("full_gc_threshold=3");
        let policy = heap.policy();

        policy.record_degenerated(false, true, false);
        policy.record_degenerated(false, true, false);
        assert!(!policy.should_upgrade_degenerated_gc(&heap));
        policy.record_degenerated(false, true, false);
        assert!(policy.should_upgrade_degenerated_gc(&heap));

        // A successful full GC resets the streak.
        policy.record_success_full();
        assert!(!policy.should_upgrade_degenerated_gc(&heap));
        assert_eq!(policy.consecutive_degenerated_gc_count(), 0);

        heap.shutdown();
    });
}
