mod common;

use veldt::gc::concurrent::ConcurrentGc;
use veldt::generation::GenerationKind;
use veldt::object;
use veldt::util::test_util::with_serial_lock;
use veldt::{GcCause, ObjectKind};

/// A weak reference with an otherwise-unreachable referent is cleared and
/// lands on the pending list; a strongly reachable referent keeps it intact.
#[test]
fn weak_reference_clears_when_referent_dies() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        let dead_referent = mutator.alloc(0, 4, ObjectKind::Regular).unwrap();
        let live_referent = mutator.alloc(0, 4, ObjectKind::Regular).unwrap();

        let clearing = mutator.alloc(0, 0, ObjectKind::Weak).unwrap();
        mutator.store_ref(clearing, object::REFERENT_SLOT, Some(dead_referent));
        let holding = mutator.alloc(0, 0, ObjectKind::Weak).unwrap();
        mutator.store_ref(holding, object::REFERENT_SLOT, Some(live_referent));

        let r_clearing = mutator.add_root(clearing);
        let r_holding = mutator.add_root(holding);
        mutator.add_root(live_referent);

        mutator.request_gc(GcCause::SystemGc);

        // Re-read through the healed roots; the references may have moved.
        let clearing = mutator.get_root(r_clearing);
        let holding = mutator.get_root(r_holding);

        assert_eq!(
            mutator.load_ref(clearing, object::REFERENT_SLOT),
            None,
            "dead referent must have been cleared"
        );
        assert!(
            mutator.load_ref(holding, object::REFERENT_SLOT).is_some(),
            "live referent must survive"
        );
        assert!(object::is_inactive(clearing));
        assert!(!object::is_inactive(holding));

        let pending = heap.take_pending_references();
        assert!(pending.contains(&clearing), "cleared reference must be pending");

        drop(mutator);
        heap.shutdown();
    });
}

/// A FINAL reference keeps its referent alive exactly once: the first cycle
/// marks the referent and enqueues the reference; once the "finalizer" ran
/// (the test clears the referent slot), the next cycle lets it die.
#[test]
fn final_reference_keeps_referent_alive_once() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        let referent = mutator.alloc(0, 4, ObjectKind::Regular).unwrap();
        let final_ref = mutator.alloc(0, 0, ObjectKind::Final).unwrap();
        mutator.store_ref(final_ref, object::REFERENT_SLOT, Some(referent));
        mutator.add_root(final_ref);

        mutator.request_gc(GcCause::SystemGc);

        // Still reachable: it got its one extra mark.
        let final_ref_now = mutator.get_root(0);
        let kept = mutator.load_ref(final_ref_now, object::REFERENT_SLOT);
        assert!(kept.is_some(), "final referent must survive the first cycle");
        assert!(object::is_finalized(final_ref_now));
        assert!(object::is_inactive(final_ref_now));
        let pending = heap.take_pending_references();
        assert!(!pending.is_empty(), "final reference must be pending");

        // The runtime's finalizer has run; sever the referent.
        mutator.store_ref(final_ref_now, object::REFERENT_SLOT, None);
        mutator.request_gc(GcCause::SystemGc);
        assert_eq!(mutator.load_ref(final_ref_now, object::REFERENT_SLOT), None);

        drop(mutator);
        heap.shutdown();
    });
}

/// Soft references are strong while the clear-all policy is off (a plain
/// young cycle) and weak when it is on (explicit cycles force it).
#[test]
fn soft_reference_policy_controls_clearing() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        let referent = mutator.alloc(0, 4, ObjectKind::Regular).unwrap();
        let soft = mutator.alloc(0, 0, ObjectKind::Soft).unwrap();
        mutator.store_ref(soft, object::REFERENT_SLOT, Some(referent));
        let root = mutator.add_root(soft);

        // Young cycle without the clear-all policy: soft behaves strongly.
        mutator.park();
        let gc = ConcurrentGc::new(&heap, GenerationKind::Young, false);
        assert!(gc.collect(GcCause::ConcurrentGc));
        mutator.unpark();
        let soft_now = mutator.get_root(root);
        assert!(mutator.load_ref(soft_now, object::REFERENT_SLOT).is_some());

        // Explicit cycle: the controller forces the clear-all policy.
        mutator.request_gc(GcCause::SystemGc);
        let soft_now = mutator.get_root(root);
        assert_eq!(mutator.load_ref(soft_now, object::REFERENT_SLOT), None);

        drop(mutator);
        heap.shutdown();
    });
}

/// Dead weak handles are pruned from the handle table by the weak-roots
/// phase; live ones survive (and follow evacuation).
#[test]
fn weak_handles_prune_dead_entries() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        let live = mutator.alloc(0, 4, ObjectKind::Regular).unwrap();
        let dead = mutator.alloc(0, 4, ObjectKind::Regular).unwrap();
        heap.add_weak_handle(live);
        heap.add_weak_handle(dead);
        mutator.add_root(live);

        mutator.request_gc(GcCause::SystemGc);

        let handles = heap.live_weak_handles();
        assert_eq!(handles.len(), 1);

        drop(mutator);
        heap.shutdown();
    });
}
