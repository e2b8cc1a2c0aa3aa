//! The heap verifier. Runs inside safepoints when the `verify*` options are
//! on; every failure is a fatal inconsistency.

use crate::heap::Heap;
use crate::object::{self, ObjectKind};
use crate::region::Affiliation;
use crate::util::address::ObjectReference;
use crate::util::constants::LOG_CARD_BYTES;

/// Validate accounting closure, collection-set/forwarding consistency, and
/// remembered-set completeness. The caller is at a safepoint.
pub fn verify_at_safepoint(heap: &Heap, label: &str) {
    debug!("Verifying heap: {}", label);
    verify_accounting(heap);
    heap.free_set().assert_partitions_disjoint(heap);
    verify_forwarding(heap, label);
    verify_remembered_set(heap, label);
}

/// Invariant: used + humongous_waste <= affiliated * region_size <= capacity,
/// and the per-generation counters agree with the region table.
fn verify_accounting(heap: &Heap) {
    let region_size = heap.region_size_bytes();
    let mut used = [0usize; 2];
    let mut affiliated = [0usize; 2];
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        let slot = match region.affiliation() {
            Affiliation::Young => 0,
            Affiliation::Old => 1,
            Affiliation::Free => continue,
        };
        used[slot] += region.used();
        affiliated[slot] += 1;
    }

    for (kind, slot) in [
        (crate::generation::GenerationKind::Young, 0),
        (crate::generation::GenerationKind::Old, 1),
    ] {
        let generation = heap.generation(kind);
        assert_eq!(
            generation.used(),
            used[slot],
            "{:?} used does not match the region table",
            kind
        );
        assert_eq!(
            generation.affiliated_region_count(),
            affiliated[slot],
            "{:?} affiliated count does not match the region table",
            kind
        );
        assert!(
            generation.used() + generation.humongous_waste()
                <= generation.affiliated_region_count() * region_size,
            "{:?} used ({}) + waste ({}) exceeds affiliated regions",
            kind,
            generation.used(),
            generation.humongous_waste()
        );
    }
    assert_eq!(
        heap.global_generation().used(),
        used[0] + used[1],
        "global used must alias young + old"
    );
}

/// Once reference updating is over, nothing reachable may be forwarded and
/// no reference may point into the collection set.
fn verify_forwarding(heap: &Heap, label: &str) {
    let state = heap.global_state();
    if state.has_forwarded_objects() || state.is_update_refs_in_progress() {
        return; // mid-cycle; forwarded objects are expected
    }
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if !region.is_regular() || !region.is_affiliated() || !region.is_parseable() {
            continue;
        }
        region.linear_walk(region.bottom(), region.top(), |obj| {
            if object::kind(obj) == ObjectKind::Filler {
                return;
            }
            let slots = object::ref_slot_count(obj);
            for i in 0..slots {
                if let Some(target) = object::get_ref(obj, i) {
                    assert!(
                        !heap.in_collection_set(target),
                        "{}: {} slot {} points into the collection set",
                        label,
                        obj,
                        i
                    );
                }
            }
        });
    }
}

/// RSet completeness: every old-to-young reference lies within a card that
/// is dirty in one of the tables.
fn verify_remembered_set(heap: &Heap, label: &str) {
    if heap.global_state().is_concurrent_old_mark_in_progress() {
        return;
    }
    let rset = heap.card_table();
    let ctx = heap.marking_context();
    let old_mark_complete = heap.old_generation().is_mark_complete();
    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if !region.is_old() || !region.is_regular() || !region.is_parseable() {
            continue;
        }
        region.linear_walk(region.bottom(), region.top(), |obj| {
            if object::kind(obj) == ObjectKind::Filler {
                return;
            }
            // Dead old objects may carry stale references whose cards have
            // legitimately gone clean.
            if old_mark_complete && !ctx.is_live(idx, obj) {
                return;
            }
            verify_object_cards(heap, obj, label, rset);
        });
    }
}

fn verify_object_cards(
    heap: &Heap,
    obj: ObjectReference,
    label: &str,
    rset: &crate::rset::RememberedSet,
) {
    let slots = object::ref_slot_count(obj);
    for i in 0..slots {
        if let Some(target) = object::get_ref(obj, i) {
            if !heap.region_of(target.to_address()).is_young() {
                continue;
            }
            let slot_addr = object::ref_slot(obj, i);
            let card = (slot_addr - heap.heap_start()) >> LOG_CARD_BYTES;
            assert!(
                rset.read_table().is_dirty(card) || rset.write_table().is_dirty(card),
                "{}: old->young reference at {} not covered by a dirty card",
                label,
                slot_addr
            );
        }
    }
}
