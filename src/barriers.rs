//! Read/write barrier implementations.
//!
//! Three barriers guard mutator heap accesses:
//!
//! * the *pre-write* (SATB) barrier logs the previous value of an
//!   overwritten reference field while any marking is in progress;
//! * the *post-write* card barrier dirties the write-table card when a
//!   reference is stored into an old region;
//! * the *load-reference* barrier redirects reads of collection-set objects
//!   to their forwarded copy, evacuating on demand, and heals the load site.
//!
//! The fast paths are a single flag test; everything else is the slow path.

use crate::heap::Heap;
use crate::object;
use crate::scheduler::MutatorShared;
use crate::util::address::{cas_slot, Address, ObjectReference};

/// Pre-write barrier: before `slot` of `obj` is overwritten, log its current
/// value into the mutator's SATB buffer. The snapshot-at-the-beginning
/// invariant is exactly this: any reference removed during marking is
/// preserved in some buffer.
#[inline]
pub fn pre_write_barrier(heap: &Heap, mutator: &MutatorShared, obj: ObjectReference, slot: usize) {
    let satb = heap.satb_queue_set();
    if !satb.is_active() {
        return;
    }
    if let Some(previous) = object::get_ref(obj, slot) {
        let mut buffer = mutator.satb.lock().unwrap();
        satb.enqueue(&mut buffer, previous);
    }
}

/// Post-write barrier: a reference stored into an old region dirties the
/// corresponding write-table card. Always active in generational mode.
#[inline]
pub fn post_write_barrier(heap: &Heap, obj: ObjectReference, slot: usize) {
    if heap.region_of(obj.to_address()).is_old() {
        let slot_addr = object::ref_slot(obj, slot);
        heap.card_table().mark_card_as_dirty(slot_addr);
    }
}

/// Load-reference barrier: resolve a reference that may point into the
/// collection set. During evacuation the mutator copies the object itself
/// (self-healing); after evacuation only the resolution remains.
#[inline]
pub fn load_reference_barrier(heap: &Heap, value: ObjectReference) -> ObjectReference {
    let state = heap.global_state();
    if !state.has_forwarded_objects() && !state.is_evacuation_in_progress() {
        return value;
    }
    if !heap.in_collection_set(value) {
        return value;
    }
    if state.is_evacuation_in_progress() {
        heap.evacuate_object(value)
    } else {
        object::resolve(value)
    }
}

/// Heal a load site: after the barrier resolved a forwarded value, publish
/// the resolved value back so later loads take the fast path. Failure means
/// somebody else already healed it.
#[inline]
pub fn heal_load_site(slot: Address, old: ObjectReference, new: ObjectReference) {
    if old != new {
        let _ = cas_slot(slot, old, new);
    }
}
