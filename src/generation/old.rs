//! The old-generation state machine.
//!
//! Old marking interleaves with young cycles: a young cycle elects to begin
//! an old mark (bootstrap), after which young cycles keep advancing old
//! marking through remembered-set scanning, root processing, and SATB
//! transfers, until candidates are chosen and mixed collections drain them.
//!
//! Expected transitions (anything else is a bug):
//!
//! ```text
//!           +----------------> +-----------------+
//!           |   +------------> |      IDLE       |
//!           |   |   +--------> |                 |
//!           |   |   |          +-----------------+
//!           |   |   |            |
//!           |   |   |            | Begin Old Mark
//!           |   |   |            v
//!           |   |   |          +-----------------+     +--------------------+
//!           |   |   |          |     FILLING     | <-> |      YOUNG GC      |
//!           |   |   |    +---> |                 |     | (RSet Uses Bitmap) |
//!           |   |   |    |     +-----------------+     +--------------------+
//!           |   |   |    |       |
//!           |   |   |    |       | Reset Bitmap
//!           |   |   |    |       v
//!           |   |   |    |     +-----------------+
//!           |   |   |    |     |    BOOTSTRAP    |
//!           |   |   |    |     +-----------------+
//!           |   |   |    |       |
//!           |   |   |    |       | Continue Marking
//!           |   |   |    |       v
//!           |   |   |    |     +-----------------+     +----------------------+
//!           |   |   |    |     |    MARKING      | <-> |       YOUNG GC       |
//!           |   |   +----|-----|                 |     | (RSet Parses Region) |
//!           |   |        |     +-----------------+     +----------------------+
//!           |   |        |       |
//!           |   |        |       | Has Candidates
//!           |   |        |       v
//!           |   |        |     +-----------------+
//!           |   +--------|---> |   WAITING FOR   |
//!           |            |     |   EVACUATIONS   |
//!           |            |     +-----------------+
//!           |            |       |
//!           |            |       | All Candidates are Pinned
//!           |            |       v
//!           |            |     +-----------------+
//!           |            +---- |   WAITING FOR   |
//!           +----------------> |   FILLING       |
//!                              +-----------------+
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use strum_macros::Display;

use crate::heap::Heap;
use crate::object;
use crate::util::address::ObjectReference;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum OldGenState {
    #[strum(serialize = "Idle")]
    Idle,
    #[strum(serialize = "Coalescing")]
    Filling,
    #[strum(serialize = "Bootstrapping")]
    Bootstrapping,
    #[strum(serialize = "Marking")]
    Marking,
    #[strum(serialize = "Waiting for evacuation")]
    WaitingForEvac,
    #[strum(serialize = "Waiting for fill")]
    WaitingForFill,
}

/// State the old generation carries beyond its accounting: the marking
/// lifecycle, whether coalesce-and-fill is underway, whether the old queues
/// are visible to young cycles, and pending in-place promotions.
pub struct OldGenerationState {
    state: Mutex<OldGenState>,
    /// Coalesce-and-fill is in progress (may be preempted and resumed).
    preparing_for_mark: AtomicBool,
    /// Old task queues are installed on young cycles: their remembered-set
    /// scan and root marking now discover old roots too.
    queues_installed: AtomicBool,
    /// Aged young regions promoted in place at the end of the cycle.
    promote_in_place: Mutex<Vec<usize>>,
    /// Old occupancy when the last old mark completed; the growth trigger
    /// measures against this.
    used_at_last_mark: AtomicUsize,
}

impl OldGenerationState {
    pub fn new() -> OldGenerationState {
        OldGenerationState {
            state: Mutex::new(OldGenState::Idle),
            preparing_for_mark: AtomicBool::new(false),
            queues_installed: AtomicBool::new(false),
            promote_in_place: Mutex::new(Vec::new()),
            used_at_last_mark: AtomicUsize::new(0),
        }
    }

    pub fn used_at_last_mark(&self) -> usize {
        self.used_at_last_mark.load(Ordering::Acquire)
    }

    pub fn set_used_at_last_mark(&self, used: usize) {
        self.used_at_last_mark.store(used, Ordering::Release);
    }

    pub fn state(&self) -> OldGenState {
        *self.state.lock().unwrap()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == OldGenState::Idle
    }

    pub fn is_preparing_for_mark(&self) -> bool {
        self.preparing_for_mark.load(Ordering::Acquire)
    }

    pub fn set_preparing_for_mark(&self, preparing: bool) {
        self.preparing_for_mark.store(preparing, Ordering::Release);
    }

    pub fn are_queues_installed(&self) -> bool {
        self.queues_installed.load(Ordering::Acquire)
    }

    pub fn set_queues_installed(&self, installed: bool) {
        self.queues_installed.store(installed, Ordering::Release);
    }

    pub fn transition_to(&self, heap: &Heap, new_state: OldGenState) {
        let mut state = self.state.lock().unwrap();
        if *state != new_state {
            info!("Old generation transition from {} to {}", *state, new_state);
            self.validate_transition(heap, *state, new_state);
            *state = new_state;
        }
    }

    fn validate_transition(&self, heap: &Heap, old: OldGenState, new_state: OldGenState) {
        let candidates = heap
            .old_heuristics()
            .unprocessed_old_collection_candidates();
        match new_state {
            OldGenState::Idle => {
                // Cancellation can send us back to idle from any state.
                assert!(
                    !heap.global_state().is_concurrent_old_mark_in_progress(),
                    "Cannot become idle during old mark"
                );
                assert!(candidates == 0, "Cannot become idle with collection candidates");
                assert!(
                    !self.is_preparing_for_mark(),
                    "Cannot become idle while making old regions parseable"
                );
                assert!(
                    !self.are_queues_installed(),
                    "Cannot become idle when setup for bootstrapping"
                );
            }
            OldGenState::Filling => {
                assert!(
                    old == OldGenState::Idle || old == OldGenState::WaitingForFill,
                    "Cannot begin filling without first completing evacuations, state is '{}'",
                    old
                );
                assert!(
                    self.is_preparing_for_mark(),
                    "Should be preparing for old mark now"
                );
            }
            OldGenState::Bootstrapping => {
                assert!(
                    old == OldGenState::Filling,
                    "Cannot reset bitmap without making old regions parseable, state is '{}'",
                    old
                );
                assert!(
                    candidates == 0,
                    "Cannot bootstrap with mixed collection candidates"
                );
                assert!(
                    !self.is_preparing_for_mark(),
                    "Cannot still be making old regions parseable"
                );
            }
            OldGenState::Marking => {
                assert!(
                    old == OldGenState::Bootstrapping,
                    "Must have finished bootstrapping before marking, state is '{}'",
                    old
                );
                assert!(
                    self.are_queues_installed(),
                    "Young generation needs old mark queues"
                );
                assert!(
                    heap.global_state().is_concurrent_old_mark_in_progress(),
                    "Should be marking old now"
                );
            }
            OldGenState::WaitingForEvac => {
                assert!(
                    old == OldGenState::Idle || old == OldGenState::Marking,
                    "Cannot have old collection candidates without first marking, state is '{}'",
                    old
                );
                assert!(candidates > 0, "Must have collection candidates here");
            }
            OldGenState::WaitingForFill => {
                assert!(
                    old == OldGenState::Idle
                        || old == OldGenState::Marking
                        || old == OldGenState::WaitingForEvac,
                    "Cannot begin filling without first marking or evacuating, state is '{}'",
                    old
                );
                assert!(
                    heap.old_heuristics().has_coalesce_and_fill_candidates(),
                    "Cannot wait for fill without something to fill"
                );
            }
        }
    }

    // in-place promotion

    pub fn register_in_place_promotions(&self, regions: Vec<usize>) {
        *self.promote_in_place.lock().unwrap() = regions;
    }

    pub fn has_in_place_promotions(&self) -> bool {
        !self.promote_in_place.lock().unwrap().is_empty()
    }

    pub fn take_in_place_promotions(&self) -> Vec<usize> {
        std::mem::take(&mut *self.promote_in_place.lock().unwrap())
    }
}

impl Default for OldGenerationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Transfer the SATB snapshot into the old mark queues, filtered to pointers
/// into active old regions. Called at young final mark while old marking is
/// in progress, after every mutator buffer has been flushed.
pub fn transfer_pointers_from_satb(heap: &Heap) {
    debug_assert!(heap.global_state().is_concurrent_old_mark_in_progress());
    info!("Transfer SATB buffers");
    let satb = heap.satb_queue_set();
    satb.filter(|obj| {
        let region = heap.region(heap.region_index_of(obj.to_address()));
        region.is_old() && region.is_active()
    });
    let old_queues = heap.old_generation().task_queues();
    while let Some(buffer) = satb.pop_completed() {
        for value in buffer {
            old_mark_and_push(heap, value, old_queues);
        }
    }
}

fn old_mark_and_push(heap: &Heap, obj: ObjectReference, queues: &crate::marking::MarkQueueSet) {
    let region_index = heap.region_index_of(obj.to_address());
    let ctx = heap.marking_context();
    if obj.to_address() < ctx.tams(region_index) && ctx.mark(obj) {
        heap.region(region_index)
            .increase_live_data(object::size_bytes(obj));
        queues.push(obj);
    }
}
