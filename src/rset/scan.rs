//! Remembered-set scanning.
//!
//! Old regions are partitioned into fixed-size chunks of cards, claimed by
//! workers through an atomic cursor. For every dirty card in a claimed chunk
//! the worker walks the objects intersecting the card's address range and
//! pushes every old-to-young reference into the young mark queues as a root.
//!
//! When old marking is complete, the old mark bitmap filters out dead
//! objects. Otherwise the region must be parseable (coalesce-and-fill keeps
//! it so) and every non-filler object is visited.

use std::sync::atomic::{AtomicUsize, Ordering};

use spin::RwLock;

use crate::generation::GenerationKind;
use crate::heap::Heap;
use crate::marking;
use crate::object::{self, ObjectKind};
use crate::util::constants::*;

/// Diagnostic counters, aggregated across workers when the `card_stats`
/// option is on.
#[derive(Default, Clone, Copy, Debug)]
pub struct CardScanStats {
    pub chunks_claimed: usize,
    pub dirty_cards_scanned: usize,
    pub objects_scanned: usize,
    pub refs_pushed: usize,
}

impl CardScanStats {
    fn merge(&mut self, other: &CardScanStats) {
        self.chunks_claimed += other.chunks_claimed;
        self.dirty_cards_scanned += other.dirty_cards_scanned;
        self.objects_scanned += other.objects_scanned;
        self.refs_pushed += other.refs_pushed;
    }
}

/// One chunk: a span of cards within a single old region.
struct ScanChunk {
    region_index: usize,
    first_card: usize,
    num_cards: usize,
}

/// A remembered-set scan over the old generation, shared by the workers of
/// one scan phase.
pub struct RememberedSetScan {
    chunks: Vec<ScanChunk>,
    cursor: AtomicUsize,
    stats: RwLock<CardScanStats>,
    collect_stats: bool,
}

impl RememberedSetScan {
    /// Plan the scan: chunk every active old region.
    pub fn new(heap: &Heap) -> RememberedSetScan {
        let cards_per_region = heap.region_size_bytes() >> LOG_CARD_BYTES;
        let mut chunks = Vec::new();
        for idx in 0..heap.num_regions() {
            let region = heap.region(idx);
            if !region.is_old() || !region.is_active() || region.is_humongous_cont() {
                continue;
            }
            let mut card = 0;
            while card < cards_per_region {
                let n = RSET_CHUNK_CARDS.min(cards_per_region - card);
                chunks.push(ScanChunk {
                    region_index: idx,
                    first_card: card,
                    num_cards: n,
                });
                card += n;
            }
        }
        RememberedSetScan {
            chunks,
            cursor: AtomicUsize::new(0),
            stats: RwLock::new(CardScanStats::default()),
            collect_stats: *heap.options().card_stats,
        }
    }

    pub fn stats(&self) -> CardScanStats {
        *self.stats.read()
    }

    /// Worker body: claim and scan chunks until they run out. Polls the
    /// cancellation flag between chunks when running concurrently.
    pub fn work(&self, heap: &Heap, cancellable: bool) -> bool {
        let mut local = CardScanStats::default();
        loop {
            if cancellable && heap.global_state().is_cancelled() {
                self.flush_stats(&local);
                return false;
            }
            let claimed = self.cursor.fetch_add(1, Ordering::Relaxed);
            if claimed >= self.chunks.len() {
                break;
            }
            local.chunks_claimed += 1;
            self.scan_chunk(heap, &self.chunks[claimed], &mut local);
        }
        self.flush_stats(&local);
        true
    }

    fn flush_stats(&self, local: &CardScanStats) {
        if self.collect_stats {
            self.stats.write().merge(local);
        }
    }

    fn scan_chunk(&self, heap: &Heap, chunk: &ScanChunk, stats: &mut CardScanStats) {
        let region = heap.region(chunk.region_index);
        let rset = heap.card_table();
        let ctx = heap.marking_context();
        let old_mark_complete = heap.old_generation().is_mark_complete();
        let young_queues = heap.generation(GenerationKind::Young).task_queues();

        for card in chunk.first_card..chunk.first_card + chunk.num_cards {
            let card_start = region.bottom() + (card << LOG_CARD_BYTES);
            if card_start >= region.top() {
                break;
            }
            let global_card = rset.card_index_of(card_start);
            if !rset.read_table().is_dirty(global_card) {
                continue;
            }
            stats.dirty_cards_scanned += 1;

            let card_end = (card_start + CARD_BYTES).min(region.top());
            let origin = match region.object_walk_origin(card) {
                Some(origin) => origin,
                None => continue,
            };

            let mut cursor = origin;
            while cursor < card_end {
                let obj = crate::util::address::ObjectReference::from_address(cursor);
                let size = object::size_bytes(obj);
                let obj_end = cursor + size;
                let is_filler = object::kind(obj) == ObjectKind::Filler;
                let is_dead = old_mark_complete && !ctx.is_live(chunk.region_index, obj);
                if !is_filler && !is_dead && obj_end > card_start {
                    stats.objects_scanned += 1;
                    stats.refs_pushed += self.scan_object_in_card(
                        heap,
                        obj,
                        card_start.as_usize(),
                        card_end.as_usize(),
                        young_queues,
                    );
                }
                cursor = obj_end;
            }
        }
    }

    /// Visit the reference slots of `obj` that lie within the card window;
    /// push young targets as mark roots. Returns how many were pushed.
    fn scan_object_in_card(
        &self,
        heap: &Heap,
        obj: crate::util::address::ObjectReference,
        card_start: usize,
        card_end: usize,
        young_queues: &marking::MarkQueueSet,
    ) -> usize {
        let mut pushed = 0;
        let slots = object::ref_slot_count(obj);
        for i in 0..slots {
            let slot = object::ref_slot(obj, i);
            let raw = slot.as_usize();
            if raw < card_start || raw >= card_end {
                continue;
            }
            if let Some(target) = object::get_ref(obj, i) {
                let target_region = heap.region(heap.region_index_of(target.to_address()));
                if target_region.is_young() {
                    marking::mark_and_push(heap, target, GenerationKind::Young, None, young_queues);
                    // The pointer survives this cycle; its card must be
                    // dirty again when the tables next swap.
                    heap.card_table().mark_card_as_dirty(slot);
                    pushed += 1;
                }
            }
        }
        pushed
    }
}
