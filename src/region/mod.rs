//! Heap regions.
//!
//! The heap is carved into fixed, power-of-two sized regions, held in a dense
//! table indexed by region index. All cross-references to regions are
//! indices; only the heap owns the table.
//!
//! Region state is described by a state machine. Transitions are guarded by
//! the heap lock, which allows changing the state of several regions
//! atomically:
//!
//! ```text
//!    Empty -----------------> Regular ------> Cset <------> PinnedCset
//!      |                       |  ^  \           \
//!      |                       |  |   v            v
//!      |                       |  +- Pinned       Trash ----> Empty
//!      |                       v                    ^
//!      +---> HumongousStart / HumongousCont --------+
//! ```
//!
//! Transition into `Trash` is reclamation: from `Cset` during the normal
//! cycle, or straight from `Regular`/humongous for immediate garbage. Trash
//! regions are recycled (zeroed, returned to `Empty`) in bulk during cleanup.
//! The encoding disallows the usual logic bugs: a pinned region can never be
//! trashed or enter the collection set, humongous regions never move, and no
//! region becomes `Empty` without passing through reclamation.

pub mod cset;
pub mod free_set;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use atomic::Atomic;
use bytemuck::NoUninit;

use crate::object;
use crate::util::address::{Address, ObjectReference};
use crate::util::constants::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
#[repr(u8)]
pub enum RegionState {
    Empty,
    Regular,
    HumongousStart,
    HumongousCont,
    Cset,
    Pinned,
    PinnedCset,
    Trash,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
#[repr(u8)]
pub enum Affiliation {
    Free,
    Young,
    Old,
}

pub struct HeapRegion {
    index: usize,
    bottom: Address,
    end: Address,
    top: AtomicUsize,
    state: Atomic<RegionState>,
    affiliation: Atomic<Affiliation>,
    /// Bytes of marked live data, accumulated by marking workers. Allocations
    /// above TAMS are implicitly live and are not included here.
    live_data: AtomicUsize,
    /// Top as of the start of reference updating. Objects above this were
    /// allocated after evacuation and already carry updated references.
    update_watermark: AtomicUsize,
    /// Tenuring counter: how many young cycles this region's objects survived.
    age: AtomicUsize,
    /// True when dead spans in this (old) region have been overwritten with
    /// fillers, making it linearly parseable.
    coalesce_fill_done: AtomicBool,
    committed: AtomicBool,
    /// For `HumongousCont` regions, the index of the start region.
    humongous_start: AtomicUsize,
    /// Object-start table: for each card, the first object that starts in the
    /// card (zero if none). Serves the remembered-set scanner.
    first_start: Box<[AtomicUsize]>,
}

impl HeapRegion {
    pub fn new(index: usize, bottom: Address, region_bytes: usize) -> HeapRegion {
        debug_assert!(region_bytes.is_power_of_two());
        debug_assert!(bottom.is_aligned_to(region_bytes));
        let cards = region_bytes >> LOG_CARD_BYTES;
        HeapRegion {
            index,
            bottom,
            end: bottom + region_bytes,
            top: AtomicUsize::new(bottom.as_usize()),
            state: Atomic::new(RegionState::Empty),
            affiliation: Atomic::new(Affiliation::Free),
            live_data: AtomicUsize::new(0),
            update_watermark: AtomicUsize::new(bottom.as_usize()),
            age: AtomicUsize::new(0),
            coalesce_fill_done: AtomicBool::new(false),
            committed: AtomicBool::new(true),
            humongous_start: AtomicUsize::new(index),
            first_start: (0..cards).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    // geometry and accounting

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bottom(&self) -> Address {
        self.bottom
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn size_bytes(&self) -> usize {
        self.end - self.bottom
    }

    pub fn top(&self) -> Address {
        unsafe { Address::from_usize(self.top.load(Ordering::Acquire)) }
    }

    pub fn set_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top.as_usize(), Ordering::Release);
    }

    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }

    /// Bump-allocate `size_bytes` out of this region. The caller holds the
    /// heap lock (or owns the region exclusively, as evacuation workers do
    /// for their lab regions).
    pub fn allocate(&self, size_bytes: usize) -> Option<Address> {
        debug_assert!(size_bytes % BYTES_IN_WORD == 0);
        let top = self.top();
        if self.end - top >= size_bytes {
            self.top.store((top + size_bytes).as_usize(), Ordering::Release);
            self.record_object_start(top);
            Some(top)
        } else {
            None
        }
    }

    // state machine

    pub fn state(&self) -> RegionState {
        self.state.load(Ordering::Acquire)
    }

    pub fn affiliation(&self) -> Affiliation {
        self.affiliation.load(Ordering::Acquire)
    }

    pub fn set_affiliation(&self, affiliation: Affiliation) {
        self.affiliation.store(affiliation, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.state() == RegionState::Empty
    }

    pub fn is_regular(&self) -> bool {
        self.state() == RegionState::Regular
    }

    pub fn is_humongous_start(&self) -> bool {
        self.state() == RegionState::HumongousStart
    }

    pub fn is_humongous_cont(&self) -> bool {
        self.state() == RegionState::HumongousCont
    }

    pub fn is_humongous(&self) -> bool {
        matches!(
            self.state(),
            RegionState::HumongousStart | RegionState::HumongousCont
        )
    }

    pub fn is_cset(&self) -> bool {
        matches!(self.state(), RegionState::Cset | RegionState::PinnedCset)
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.state(), RegionState::Pinned | RegionState::PinnedCset)
    }

    pub fn is_trash(&self) -> bool {
        self.state() == RegionState::Trash
    }

    /// Active regions hold (or can hold) live objects.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            RegionState::Regular
                | RegionState::HumongousStart
                | RegionState::HumongousCont
                | RegionState::Pinned
                | RegionState::Cset
                | RegionState::PinnedCset
        )
    }

    pub fn is_young(&self) -> bool {
        self.affiliation() == Affiliation::Young
    }

    pub fn is_old(&self) -> bool {
        self.affiliation() == Affiliation::Old
    }

    pub fn is_affiliated(&self) -> bool {
        self.affiliation() != Affiliation::Free
    }

    fn transition(&self, from: &[RegionState], to: RegionState) {
        let state = self.state();
        assert!(
            from.contains(&state),
            "Illegal region state transition for region {}: {:?} -> {:?}",
            self.index,
            state,
            to
        );
        self.state.store(to, Ordering::Release);
    }

    pub fn make_regular_allocation(&self, affiliation: Affiliation) {
        debug_assert!(affiliation != Affiliation::Free);
        self.transition(
            &[RegionState::Empty, RegionState::Regular],
            RegionState::Regular,
        );
        if self.affiliation() == Affiliation::Free {
            self.set_affiliation(affiliation);
        }
        // Bump-allocated storage is linearly parseable by construction; the
        // flag drops only when marking identifies dead spans to fill.
        self.coalesce_fill_done.store(true, Ordering::Release);
        // An uncommitted region re-commits on first touch.
        self.committed.store(true, Ordering::Release);
    }

    /// Used by the degenerated and full paths to reclaim any salvageable
    /// region for regular use without going through the free set. Full GC
    /// also uses this to dissolve an abandoned collection set.
    pub fn make_regular_bypass(&self) {
        self.transition(
            &[
                RegionState::Empty,
                RegionState::Regular,
                RegionState::Trash,
                RegionState::Cset,
            ],
            RegionState::Regular,
        );
    }

    pub fn make_humongous_start(&self, affiliation: Affiliation) {
        self.transition(&[RegionState::Empty], RegionState::HumongousStart);
        self.set_affiliation(affiliation);
    }

    pub fn make_humongous_cont(&self, affiliation: Affiliation, start_index: usize) {
        self.transition(&[RegionState::Empty], RegionState::HumongousCont);
        self.set_affiliation(affiliation);
        self.humongous_start.store(start_index, Ordering::Release);
    }

    pub fn humongous_start_index(&self) -> usize {
        debug_assert!(self.is_humongous());
        self.humongous_start.load(Ordering::Acquire)
    }

    pub fn make_cset(&self) {
        self.transition(&[RegionState::Regular], RegionState::Cset);
    }

    pub fn make_pinned(&self) {
        match self.state() {
            RegionState::Regular => self.state.store(RegionState::Pinned, Ordering::Release),
            RegionState::Cset => self.state.store(RegionState::PinnedCset, Ordering::Release),
            RegionState::Pinned | RegionState::PinnedCset => {}
            s => panic!("Illegal region state transition for region {}: {:?} -> pinned", self.index, s),
        }
    }

    pub fn make_unpinned(&self) {
        match self.state() {
            RegionState::Pinned => self.state.store(RegionState::Regular, Ordering::Release),
            RegionState::PinnedCset => self.state.store(RegionState::Cset, Ordering::Release),
            s => panic!("Illegal region state transition for region {}: {:?} -> unpinned", self.index, s),
        }
    }

    /// Reclaim a collection-set or immediate-garbage region. Pinned regions
    /// can never be trashed.
    pub fn make_trash(&self) {
        self.transition(
            &[
                RegionState::Cset,
                RegionState::Regular,
                RegionState::HumongousStart,
                RegionState::HumongousCont,
            ],
            RegionState::Trash,
        );
    }

    /// Recycle a trash region back to empty. The caller zeroes the memory.
    pub fn make_empty(&self) {
        self.transition(&[RegionState::Trash], RegionState::Empty);
        self.set_affiliation(Affiliation::Free);
        self.top.store(self.bottom.as_usize(), Ordering::Release);
        self.update_watermark
            .store(self.bottom.as_usize(), Ordering::Release);
        self.live_data.store(0, Ordering::Release);
        self.age.store(0, Ordering::Release);
        self.coalesce_fill_done.store(false, Ordering::Release);
        self.reset_object_starts();
    }

    // live data

    pub fn reset_live_data(&self) {
        self.live_data.store(0, Ordering::Release);
    }

    pub fn increase_live_data(&self, bytes: usize) {
        self.live_data.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Marked live bytes. Allocations above TAMS are not included; callers
    /// that need total liveness add `top - tams` themselves.
    pub fn live_data(&self) -> usize {
        self.live_data.load(Ordering::Acquire)
    }

    pub fn set_live_data(&self, bytes: usize) {
        self.live_data.store(bytes, Ordering::Release);
    }

    // update-refs watermark

    pub fn update_watermark(&self) -> Address {
        unsafe { Address::from_usize(self.update_watermark.load(Ordering::Acquire)) }
    }

    pub fn capture_update_watermark(&self) {
        self.update_watermark
            .store(self.top().as_usize(), Ordering::Release);
    }

    pub fn reset_update_watermark(&self) {
        self.update_watermark
            .store(self.bottom.as_usize(), Ordering::Release);
    }

    // aging

    pub fn age(&self) -> usize {
        self.age.load(Ordering::Acquire)
    }

    pub fn increment_age(&self) {
        self.age.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_age(&self) {
        self.age.store(0, Ordering::Release);
    }

    // parseability

    pub fn is_parseable(&self) -> bool {
        self.coalesce_fill_done.load(Ordering::Acquire)
    }

    pub fn set_coalesce_fill_done(&self, done: bool) {
        self.coalesce_fill_done.store(done, Ordering::Release);
    }

    // commit state

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub fn set_committed(&self, committed: bool) {
        self.committed.store(committed, Ordering::Release);
    }

    // object-start table

    fn card_of(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.bottom) >> LOG_CARD_BYTES
    }

    /// Remember `addr` as an object start if it is the first in its card.
    pub fn record_object_start(&self, addr: Address) {
        let slot = &self.first_start[self.card_of(addr)];
        let raw = addr.as_usize();
        let prev = slot.load(Ordering::Relaxed);
        if prev == 0 || prev > raw {
            slot.store(raw, Ordering::Relaxed);
        }
    }

    /// The first object starting within card `card` of this region, if any.
    pub fn first_object_in_card(&self, card: usize) -> Option<Address> {
        let raw = self.first_start[card].load(Ordering::Relaxed);
        if raw == 0 {
            None
        } else {
            Some(unsafe { Address::from_usize(raw) })
        }
    }

    /// The first object whose range may intersect card `card`: the closest
    /// recorded start at or before the card, as a walk origin.
    pub fn object_walk_origin(&self, card: usize) -> Option<Address> {
        for c in (0..=card).rev() {
            if let Some(start) = self.first_object_in_card(c) {
                return Some(start);
            }
        }
        None
    }

    pub fn reset_object_starts(&self) {
        for slot in self.first_start.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Walk objects linearly in `[from, to)`. The range must be parseable:
    /// bump-allocated, or coalesce-filled.
    pub fn linear_walk<F: FnMut(ObjectReference)>(&self, from: Address, to: Address, mut f: F) {
        let mut cursor = from;
        while cursor < to {
            let obj = ObjectReference::from_address(cursor);
            let size = object::size_bytes(obj);
            debug_assert!(size >= object::MIN_OBJECT_WORDS * BYTES_IN_WORD, "corrupt object size at {}", cursor);
            f(obj);
            cursor = cursor + size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> (crate::util::memory::BackingStore, HeapRegion) {
        let store = crate::util::memory::BackingStore::new(MIN_REGION_BYTES, MIN_REGION_BYTES);
        let r = HeapRegion::new(0, store.start(), MIN_REGION_BYTES);
        (store, r)
    }

    #[test]
    fn fresh_region_is_empty_free() {
        let (_store, r) = region();
        assert!(r.is_empty());
        assert!(!r.is_affiliated());
        assert_eq!(r.used(), 0);
        assert_eq!(r.free(), MIN_REGION_BYTES);
    }

    #[test]
    fn allocation_bumps_top() {
        let (_store, r) = region();
        r.make_regular_allocation(Affiliation::Young);
        let a = r.allocate(64).unwrap();
        let b = r.allocate(64).unwrap();
        assert_eq!(b, a + 64usize);
        assert_eq!(r.used(), 128);
        assert!(r.allocate(MIN_REGION_BYTES).is_none());
    }

    #[test]
    fn lifecycle_roundtrip() {
        let (_store, r) = region();
        r.make_regular_allocation(Affiliation::Young);
        r.make_cset();
        assert!(r.is_cset());
        r.make_trash();
        assert!(r.is_trash());
        r.make_empty();
        assert!(r.is_empty());
        assert_eq!(r.affiliation(), Affiliation::Free);
        assert_eq!(r.age(), 0);
    }

    #[test]
    fn pinning_blocks_cset() {
        let (_store, r) = region();
        r.make_regular_allocation(Affiliation::Young);
        r.make_pinned();
        assert!(r.is_pinned());
        r.make_unpinned();
        assert!(r.is_regular());
    }

    #[test]
    #[should_panic(expected = "Illegal region state transition")]
    fn empty_cannot_be_trashed() {
        let (_store, r) = region();
        r.make_trash();
    }

    #[test]
    #[should_panic(expected = "Illegal region state transition")]
    fn pinned_cannot_be_trashed() {
        let (_store, r) = region();
        r.make_regular_allocation(Affiliation::Young);
        r.make_pinned();
        r.make_trash();
    }

    #[test]
    fn object_start_table() {
        let (_store, r) = region();
        r.make_regular_allocation(Affiliation::Old);
        let a = r.allocate(CARD_BYTES - 64).unwrap();
        let b = r.allocate(128).unwrap();
        assert_eq!(r.first_object_in_card(0), Some(a));
        // b starts in the last 64 bytes of card 0.
        assert_eq!(r.card_of(b), 0);
        let c = r.allocate(64).unwrap();
        assert_eq!(r.first_object_in_card(1), Some(c));
        assert_eq!(r.object_walk_origin(1), Some(c));
        r.reset_object_starts();
        assert_eq!(r.first_object_in_card(0), None);
    }
}
