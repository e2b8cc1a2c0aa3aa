//! Young/old capacity apportionment.
//!
//! Transfers between the generations are whole regions. The sizer enforces
//! a minimum young size (one region) and keeps the sum of generation
//! capacities equal to the heap capacity.

use crate::generation::GenerationKind;
use crate::heap::Heap;

pub struct GenerationSizer {
    region_size_bytes: usize,
    heap_capacity: usize,
}

impl GenerationSizer {
    pub fn new(region_size_bytes: usize, heap_capacity: usize) -> GenerationSizer {
        GenerationSizer {
            region_size_bytes,
            heap_capacity,
        }
    }

    pub fn min_young_capacity(&self) -> usize {
        self.region_size_bytes
    }

    pub fn max_young_capacity(&self) -> usize {
        self.heap_capacity.saturating_sub(self.region_size_bytes)
    }

    /// Move `regions` regions of capacity from old to young. Returns false
    /// (doing nothing) if the transfer would violate the bounds or shrink a
    /// generation below its affiliated regions.
    pub fn transfer_to_young(&self, heap: &Heap, regions: usize) -> bool {
        self.transfer(heap, regions, GenerationKind::Old, GenerationKind::Young)
    }

    /// Move `regions` regions of capacity from young to old.
    pub fn transfer_to_old(&self, heap: &Heap, regions: usize) -> bool {
        self.transfer(heap, regions, GenerationKind::Young, GenerationKind::Old)
    }

    fn transfer(
        &self,
        heap: &Heap,
        regions: usize,
        from: GenerationKind,
        to: GenerationKind,
    ) -> bool {
        if regions == 0 {
            return true;
        }
        let bytes = regions * self.region_size_bytes;
        let from_gen = heap.generation(from);
        let to_gen = heap.generation(to);

        if from_gen.max_capacity() < bytes
            || from_gen.max_capacity() - bytes
                < from_gen.affiliated_region_count() * self.region_size_bytes
        {
            return false;
        }
        let new_young = match to {
            GenerationKind::Young => to_gen.max_capacity() + bytes,
            _ => from_gen.max_capacity() - bytes,
        };
        if new_young < self.min_young_capacity() || new_young > self.max_young_capacity() {
            return false;
        }

        from_gen.decrease_capacity(bytes, self.region_size_bytes);
        to_gen.increase_capacity(bytes, self.region_size_bytes);
        debug!(
            "Transferred {} regions from {:?} to {:?} (young now {} bytes)",
            regions,
            from,
            to,
            heap.generation(GenerationKind::Young).max_capacity()
        );
        true
    }

    /// Reset the split after a full GC: young gets its configured share,
    /// old the rest.
    pub fn reset_apportionment(&self, heap: &Heap, young_capacity: usize) {
        let young = young_capacity
            .clamp(self.min_young_capacity(), self.max_young_capacity());
        heap.generation(GenerationKind::Young).set_capacity(young);
        heap.generation(GenerationKind::Old)
            .set_capacity(self.heap_capacity - young);
    }
}
