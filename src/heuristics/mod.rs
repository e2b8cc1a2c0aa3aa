//! Heuristics: when to trigger a cycle and which regions to collect.
//!
//! One boxed heuristic per generation, chosen at startup from the
//! `heuristics` option. The old generation additionally owns a concrete
//! [`old::OldHeuristics`] that tracks mixed-collection candidates and
//! coalesce-and-fill work across cycles.

pub mod adaptive;
pub mod old;

use crate::heap::Heap;

pub trait Heuristics: Send {
    fn name(&self) -> &'static str;

    /// Does this generation want a cycle right now? Called by the control
    /// thread on every loop iteration.
    fn should_start_gc(&mut self, heap: &Heap) -> bool;

    /// Pick the young/global collection set, region by region in descending
    /// garbage order, until the evacuation budget is exhausted. Regions
    /// preselected for promotion are included against the promotion budget.
    fn choose_collection_set(&mut self, heap: &Heap);

    /// Preselect aged regions for promotion, up to `budget` bytes of live
    /// data (pre-waste). Marks them in `preselected`, returns the live bytes
    /// consumed.
    fn select_aged_regions(&mut self, heap: &Heap, budget: usize, preselected: &mut [bool])
        -> usize;

    /// Should an allocation failure degenerate rather than go straight to
    /// full GC? False once the policy sees too many futile degenerations.
    fn should_degenerate_cycle(&self, heap: &Heap) -> bool {
        !heap.policy().should_upgrade_degenerated_gc(heap)
    }

    /// A trigger has been consumed; stop asking until conditions rebuild.
    fn cancel_trigger_request(&mut self) {}

    fn record_cycle_start(&mut self) {}
    fn record_success_concurrent(&mut self, _abbreviated: bool) {}
    fn record_allocation_failure_gc(&mut self) {}
    fn record_requested_gc(&mut self) {}
}

/// Build the configured heuristic for a generation.
pub fn new_heuristics(
    selector: crate::util::options::HeuristicsSelector,
    kind: crate::generation::GenerationKind,
) -> Box<dyn Heuristics> {
    match selector {
        crate::util::options::HeuristicsSelector::Adaptive => {
            Box::new(adaptive::AdaptiveHeuristics::new(kind))
        }
        crate::util::options::HeuristicsSelector::Static => {
            Box::new(adaptive::StaticHeuristics::new(kind))
        }
    }
}
