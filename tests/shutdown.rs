mod common;

use std::time::Duration;

use veldt::util::test_util::{wait_until, with_serial_lock};
use veldt::GcCause;

/// Shutdown is clean: the stop cause is sticky, every GC thread joins, and
/// late requests are refused instead of hanging.
#[test]
fn shutdown_joins_all_threads() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();
        let _ = common::alloc_chain(&mutator, 50, 8);
        drop(mutator);

        heap.shutdown();
        assert!(heap.policy().is_at_shutdown());
        assert_eq!(heap.global_state().cancelled_cause(), GcCause::StopVm);

        // A request after shutdown returns immediately.
        heap.request_gc(GcCause::SystemGc);
    });
}

/// Cancelling with the stop cause wins over later cancellations and stops
/// the control thread from starting new cycles.
#[test]
fn stop_cause_is_sticky() {
    with_serial_lock(|| {
        let heap = common::heap("");
        heap.cancel_gc(GcCause::StopVm);
        heap.cancel_gc(GcCause::AllocFailure);
        assert_eq!(heap.global_state().cancelled_cause(), GcCause::StopVm);

        let id_before = heap.global_state().gc_id();
        // The control thread must be idle (or exiting); no cycle starts.
        assert!(wait_until(Duration::from_millis(100), || true));
        assert_eq!(heap.global_state().gc_id(), id_before);

        heap.shutdown();
    });
}
