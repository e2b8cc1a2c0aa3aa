//! The adaptive (default) and static heuristics for young/global cycles.

use std::time::Instant;

use portable_atomic::AtomicF64;
use std::sync::atomic::Ordering;

use crate::generation::GenerationKind;
use crate::heap::Heap;
use crate::heuristics::Heuristics;
use crate::util::conversions::display_bytes;

/// Smoothing factor for the allocation-rate and cycle-time EWMAs.
const EWMA_ALPHA: f64 = 0.3;
/// Do not resample the allocation rate more often than this.
const SAMPLE_INTERVAL_MS: u128 = 10;

pub struct AdaptiveHeuristics {
    kind: GenerationKind,
    /// Observed allocation rate, bytes/sec. Readable without the generation
    /// lock (diagnostics), hence atomic.
    alloc_rate: AtomicF64,
    last_sample: Option<(Instant, usize)>,
    cycle_start: Option<Instant>,
    last_cycle_end: Instant,
    /// Seconds a full concurrent cycle tends to take.
    cycle_time_ewma: f64,
    trigger_cancelled: bool,
}

impl AdaptiveHeuristics {
    pub fn new(kind: GenerationKind) -> AdaptiveHeuristics {
        AdaptiveHeuristics {
            kind,
            alloc_rate: AtomicF64::new(0.0),
            last_sample: None,
            cycle_start: None,
            last_cycle_end: Instant::now(),
            cycle_time_ewma: 0.1,
            trigger_cancelled: false,
        }
    }

    fn sample_allocation_rate(&mut self, heap: &Heap) {
        let now = Instant::now();
        let allocated = heap.global_state().bytes_allocated_since_gc_start();
        match self.last_sample {
            Some((at, prev)) if now.duration_since(at).as_millis() >= SAMPLE_INTERVAL_MS => {
                let dt = now.duration_since(at).as_secs_f64();
                let delta = allocated.saturating_sub(prev) as f64;
                let rate = delta / dt;
                let smoothed =
                    EWMA_ALPHA * rate + (1.0 - EWMA_ALPHA) * self.alloc_rate.load(Ordering::Relaxed);
                self.alloc_rate.store(smoothed, Ordering::Relaxed);
                self.last_sample = Some((now, allocated));
            }
            None => self.last_sample = Some((now, allocated)),
            _ => {}
        }
    }
}

impl Heuristics for AdaptiveHeuristics {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn should_start_gc(&mut self, heap: &Heap) -> bool {
        if self.trigger_cancelled {
            // Wait until the cycle we triggered for has run.
            self.trigger_cancelled = false;
            return false;
        }
        self.sample_allocation_rate(heap);

        let generation = heap.generation(self.kind);
        let capacity = generation.max_capacity();
        let available = generation.available();
        let options = heap.options();

        let min_threshold = capacity / 100 * *options.min_free_threshold_percent;
        if available < min_threshold {
            info!(
                "Trigger ({:?}): Free ({}) is below minimum threshold ({})",
                self.kind,
                display_bytes(available),
                display_bytes(min_threshold)
            );
            return true;
        }

        let interval = *options.guaranteed_gc_interval_ms;
        if interval > 0 && self.last_cycle_end.elapsed().as_millis() as u64 > interval {
            info!(
                "Trigger ({:?}): Time since last GC exceeds guaranteed interval ({} ms)",
                self.kind, interval
            );
            return true;
        }

        let rate = self.alloc_rate.load(Ordering::Relaxed);
        let headroom_needed = rate * *options.alloc_spike_factor * self.cycle_time_ewma;
        if rate > 0.0 && (available as f64) < headroom_needed {
            info!(
                "Trigger ({:?}): Projected allocation ({}/s over {:.3}s cycles) exhausts free ({})",
                self.kind,
                display_bytes(rate as usize),
                self.cycle_time_ewma,
                display_bytes(available)
            );
            return true;
        }
        false
    }

    fn choose_collection_set(&mut self, heap: &Heap) {
        choose_collection_set_by_garbage(heap, self.kind);
    }

    fn select_aged_regions(
        &mut self,
        heap: &Heap,
        budget: usize,
        preselected: &mut [bool],
    ) -> usize {
        preselect_aged_regions(heap, budget, preselected)
    }

    fn cancel_trigger_request(&mut self) {
        self.trigger_cancelled = true;
    }

    fn record_cycle_start(&mut self) {
        self.cycle_start = Some(Instant::now());
    }

    fn record_success_concurrent(&mut self, _abbreviated: bool) {
        if let Some(start) = self.cycle_start.take() {
            let secs = start.elapsed().as_secs_f64();
            self.cycle_time_ewma = EWMA_ALPHA * secs + (1.0 - EWMA_ALPHA) * self.cycle_time_ewma;
        }
        self.last_cycle_end = Instant::now();
    }

    fn record_allocation_failure_gc(&mut self) {
        self.last_cycle_end = Instant::now();
    }

    fn record_requested_gc(&mut self) {
        self.last_cycle_end = Instant::now();
    }
}

/// Trigger on the free threshold only. Deterministic; used in tests and as a
/// baseline.
pub struct StaticHeuristics {
    kind: GenerationKind,
    trigger_cancelled: bool,
}

impl StaticHeuristics {
    pub fn new(kind: GenerationKind) -> StaticHeuristics {
        StaticHeuristics {
            kind,
            trigger_cancelled: false,
        }
    }
}

impl Heuristics for StaticHeuristics {
    fn name(&self) -> &'static str {
        "static"
    }

    fn should_start_gc(&mut self, heap: &Heap) -> bool {
        if self.trigger_cancelled {
            self.trigger_cancelled = false;
            return false;
        }
        let generation = heap.generation(self.kind);
        let capacity = generation.max_capacity();
        let available = generation.available();
        let min_threshold = capacity / 100 * *heap.options().min_free_threshold_percent;
        if available < min_threshold {
            info!(
                "Trigger ({:?}): Free ({}) is below minimum threshold ({})",
                self.kind,
                display_bytes(available),
                display_bytes(min_threshold)
            );
            return true;
        }
        false
    }

    fn choose_collection_set(&mut self, heap: &Heap) {
        choose_collection_set_by_garbage(heap, self.kind);
    }

    fn select_aged_regions(
        &mut self,
        heap: &Heap,
        budget: usize,
        preselected: &mut [bool],
    ) -> usize {
        preselect_aged_regions(heap, budget, preselected)
    }

    fn cancel_trigger_request(&mut self) {
        self.trigger_cancelled = true;
    }
}

/// Total live bytes of a region in the current cycle: marked live plus
/// everything allocated above TAMS.
pub fn region_live_bytes(heap: &Heap, region: &crate::region::HeapRegion) -> usize {
    let tams = heap.marking_context().tams(region.index());
    let above = if region.top() > tams {
        region.top() - tams
    } else {
        0
    };
    region.live_data() + above
}

/// The shared selection pass: regular regions with enough garbage, in
/// descending garbage order, until the young evacuation budget (net of the
/// waste multiplier) is spent. Preselected promotion regions ride along
/// against the promotion reserve.
fn choose_collection_set_by_garbage(heap: &Heap, kind: GenerationKind) {
    let options = heap.options();
    let cset = heap.collection_set();
    let region_size = heap.region_size_bytes();
    let garbage_threshold = region_size / 100 * *options.garbage_threshold_percent;

    let mut young_budget =
        (heap.reserves().young_evac_reserve() as f64 / *options.evac_waste) as usize;
    let mut old_budget =
        (heap.reserves().old_evac_reserve() as f64 / *options.old_evac_waste) as usize;
    let mut candidates: Vec<(usize, usize, usize)> = Vec::new(); // (index, garbage, live)

    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if !region.is_regular() || !region.is_affiliated() {
            continue;
        }
        let in_generation = match kind {
            GenerationKind::Global => true,
            GenerationKind::Young => region.is_young(),
            GenerationKind::Old => region.is_old(),
        };
        if !in_generation {
            continue;
        }
        let live = region_live_bytes(heap, region);
        let garbage = region.used().saturating_sub(live);
        if cset.is_preselected(idx) {
            // Aged region headed for promotion; budgeted from the promotion
            // reserve during preselection.
            cset.add_region(region, live, garbage, true);
            continue;
        }
        if garbage >= garbage_threshold {
            candidates.push((idx, garbage, live));
        }
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    for (idx, garbage, live) in candidates {
        let region = heap.region(idx);
        let budget = if region.is_old() {
            &mut old_budget
        } else {
            &mut young_budget
        };
        if live > *budget {
            continue;
        }
        cset.add_region(region, live, garbage, false);
        *budget -= live;
    }
}

/// Preselect aged regions for copying promotion, staying within `budget`
/// bytes of waste-adjusted promotion reserve. Regions dense enough to
/// promote in place are left out; the engine flips their affiliation at the
/// end of the cycle instead of copying them.
fn preselect_aged_regions(heap: &Heap, budget: usize, preselected: &mut [bool]) -> usize {
    let options = heap.options();
    let tenuring_age = *options.tenuring_age;
    let waste = *options.promo_evac_waste;
    let in_place_percent = *options.in_place_promotion_live_percent;
    let region_size = heap.region_size_bytes();
    let mut consumed = 0usize;

    for idx in 0..heap.num_regions() {
        let region = heap.region(idx);
        if !region.is_young() || !region.is_regular() || region.age() < tenuring_age {
            continue;
        }
        let live = region_live_bytes(heap, region);
        if live == 0 {
            continue;
        }
        if live * 100 >= region_size * in_place_percent {
            continue; // in-place promotion candidate
        }
        let cost = (live as f64 * waste) as usize;
        if consumed + cost <= budget {
            preselected[idx] = true;
            consumed += cost;
        }
    }
    consumed
}
