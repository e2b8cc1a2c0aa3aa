mod common;

use veldt::util::test_util::with_serial_lock;
use veldt::GcCause;

/// A concurrent cycle with both survivors and garbage: live data survives
/// with contents intact, garbage regions are reclaimed, and the policy
/// records a successful concurrent cycle.
#[test]
fn concurrent_cycle_reclaims_garbage_and_keeps_survivors() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        let head = common::alloc_chain(&mutator, 200, 16);
        let root = mutator.add_root(head);

        // A few megabytes of unreachable objects, spread over many regions.
        for _ in 0..2000 {
            let _ = mutator.alloc(0, 200, veldt::ObjectKind::Regular).unwrap();
        }

        let used_before = heap.young_generation().used();
        mutator.request_gc(GcCause::SystemGc);
        let used_after = heap.young_generation().used();

        assert!(
            used_after < used_before,
            "cycle must reclaim garbage ({} -> {})",
            used_before,
            used_after
        );
        assert!(heap.policy().success_concurrent_count() >= 1);
        assert_eq!(heap.policy().consecutive_degenerated_gc_count(), 0);

        // The survivors (possibly evacuated) read back through the healed
        // root.
        let head = mutator.get_root(root);
        assert_eq!(common::check_chain(&mutator, head), 200);

        drop(mutator);
        heap.shutdown();
    });
}

/// When all reclaimable memory is immediate garbage, the cycle is
/// abbreviated: no evacuation, no reference updating, but the free set is
/// rebuilt and waiters still notified.
#[test]
fn all_garbage_heap_takes_the_abbreviated_path() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        for _ in 0..3000 {
            let _ = mutator.alloc(1, 100, veldt::ObjectKind::Regular).unwrap();
        }
        mutator.clear_roots();

        mutator.request_gc(GcCause::SystemGc);

        assert!(
            heap.policy().abbreviated_concurrent_count() >= 1,
            "an all-garbage cycle must be abbreviated"
        );
        // Immediate garbage was recycled without evacuation.
        assert!(heap.young_generation().used() < 4 * common::REGION);

        drop(mutator);
        heap.shutdown();
    });
}

/// A breakpoint request does not block the requester; the cycle runs in the
/// background and acknowledges through the breakpoint-event counter.
#[test]
fn breakpoint_requests_do_not_block() {
    use std::time::Duration;
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();
        let _ = common::alloc_chain(&mutator, 10, 8);

        heap.request_gc(GcCause::WbBreakpoint); // returns immediately
        mutator.park();
        assert!(
            veldt::util::test_util::wait_until(Duration::from_secs(5), || {
                heap.control().breakpoint_events() >= 1
            }),
            "breakpoint cycle never ran"
        );
        mutator.unpark();

        drop(mutator);
        heap.shutdown();
    });
}

/// Two explicit requests back to back both complete (waiter protocol), and
/// gc ids advance monotonically.
#[test]
fn explicit_requests_block_until_a_cycle_completes() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        let id_before = heap.global_state().gc_id();
        mutator.request_gc(GcCause::SystemGc);
        let id_mid = heap.global_state().gc_id();
        assert!(id_mid > id_before);
        mutator.request_gc(GcCause::SystemGc);
        assert!(heap.global_state().gc_id() > id_mid);
        assert!(heap.policy().success_concurrent_count() >= 2);

        drop(mutator);
        heap.shutdown();
    });
}
