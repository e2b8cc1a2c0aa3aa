//! The remembered set: a pair of card tables tracking old-to-young pointers.
//!
//! The write table is stamped by the mutator post-write barrier; the read
//! table drives scanning. At the start of a successful young mark the tables
//! are swapped (under STW), so the cycle scans exactly the cards dirtied
//! since the previous cycle. If a mark is cancelled, the tables are merged
//! (write ∪ read → read) instead, so no dirty card is ever lost.

pub mod scan;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use static_assertions::const_assert;

use crate::util::address::Address;
use crate::util::constants::*;

/// Card values: zero means dirty, all-ones means clean.
pub const CARD_DIRTY: u8 = 0;
pub const CARD_CLEAN: u8 = 0xff;

const_assert!(CARD_BYTES.is_power_of_two());

pub struct CardTable {
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    fn new(num_cards: usize) -> CardTable {
        CardTable {
            cards: (0..num_cards).map(|_| AtomicU8::new(CARD_CLEAN)).collect(),
        }
    }

    pub fn num_cards(&self) -> usize {
        self.cards.len()
    }

    pub fn is_dirty(&self, card: usize) -> bool {
        self.cards[card].load(Ordering::Acquire) == CARD_DIRTY
    }

    pub fn mark_dirty(&self, card: usize) {
        self.cards[card].store(CARD_DIRTY, Ordering::Release);
    }

    pub fn mark_clean(&self, card: usize) {
        self.cards[card].store(CARD_CLEAN, Ordering::Release);
    }

    pub fn mark_all_clean(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }
}

/// The table pair. Which physical table is "read" is a flag flipped at
/// safepoints; barriers re-read the flag on every store, so a swap needs no
/// table copying.
pub struct RememberedSet {
    heap_start: Address,
    tables: [CardTable; 2],
    /// If set, tables[1] is the read table.
    flipped: AtomicBool,
}

impl RememberedSet {
    pub fn new(heap_start: Address, heap_bytes: usize) -> RememberedSet {
        let num_cards = heap_bytes >> LOG_CARD_BYTES;
        RememberedSet {
            heap_start,
            tables: [CardTable::new(num_cards), CardTable::new(num_cards)],
            flipped: AtomicBool::new(false),
        }
    }

    pub fn card_index_of(&self, addr: Address) -> usize {
        (addr - self.heap_start) >> LOG_CARD_BYTES
    }

    pub fn card_start_address(&self, card: usize) -> Address {
        self.heap_start + (card << LOG_CARD_BYTES)
    }

    pub fn read_table(&self) -> &CardTable {
        &self.tables[self.flipped.load(Ordering::Acquire) as usize]
    }

    pub fn write_table(&self) -> &CardTable {
        &self.tables[!self.flipped.load(Ordering::Acquire) as usize]
    }

    /// Post-write barrier slow path: dirty the write-table card covering `addr`.
    pub fn mark_card_as_dirty(&self, addr: Address) {
        self.write_table().mark_dirty(self.card_index_of(addr));
    }

    /// Swap read and write tables. STW only: after the swap the old read
    /// table (now the write table) is cleaned to receive new barrier traffic.
    pub fn swap_tables(&self) {
        self.flipped.fetch_xor(true, Ordering::AcqRel);
        self.write_table().mark_all_clean();
    }

    /// Cancelled-mark path: fold every dirty write-table card into the read
    /// table, so the snapshot of dirty cards survives into the next attempt.
    /// The write table keeps its contents; barriers are still stamping it.
    pub fn merge_write_table(&self) {
        let read = self.read_table();
        let write = self.write_table();
        for card in 0..read.num_cards() {
            if write.is_dirty(card) {
                read.mark_dirty(card);
            }
        }
    }

    /// Reset for a fresh mark: all read-table cards clean.
    pub fn mark_read_table_as_clean(&self) {
        self.read_table().mark_all_clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory::BackingStore;

    fn rset() -> (BackingStore, RememberedSet) {
        let store = BackingStore::new(MIN_REGION_BYTES, MIN_REGION_BYTES);
        let rs = RememberedSet::new(store.start(), MIN_REGION_BYTES);
        rs.mark_read_table_as_clean();
        rs.write_table().mark_all_clean();
        (store, rs)
    }

    #[test]
    fn barrier_dirties_write_table_only() {
        let (store, rs) = rset();
        let addr = store.start() + 3 * CARD_BYTES + 8;
        rs.mark_card_as_dirty(addr);
        assert!(rs.write_table().is_dirty(3));
        assert!(!rs.read_table().is_dirty(3));
    }

    #[test]
    fn swap_exposes_dirty_cards_to_scanning() {
        let (store, rs) = rset();
        rs.mark_card_as_dirty(store.start() + CARD_BYTES);
        rs.swap_tables();
        assert!(rs.read_table().is_dirty(1));
        // New write table starts clean.
        assert!(!rs.write_table().is_dirty(1));
    }

    #[test]
    fn double_swap_is_identity_modulo_cleaning() {
        let (store, rs) = rset();
        rs.mark_card_as_dirty(store.start());
        rs.swap_tables();
        assert!(rs.read_table().is_dirty(0));
        rs.swap_tables();
        // The dirty card moved back to the write side and was cleaned.
        assert!(!rs.read_table().is_dirty(0));
        assert!(!rs.write_table().is_dirty(0));
    }

    #[test]
    fn merge_preserves_both_sides() {
        let (store, rs) = rset();
        // Dirty card 1 in the read table (as if carried from a prior cycle),
        // card 2 in the write table (new barrier traffic).
        rs.read_table().mark_dirty(1);
        rs.mark_card_as_dirty(store.start() + 2 * CARD_BYTES);
        rs.merge_write_table();
        assert!(rs.read_table().is_dirty(1));
        assert!(rs.read_table().is_dirty(2));
        assert!(rs.write_table().is_dirty(2));
    }
}
