//! Collector configuration.
//!
//! Options are typed, validated, and can be set from `VELDT_`-prefixed
//! environment variables or from a bulk `key=value` string. To read an
//! option, dereference it (for example, `*options.threads`).

use std::fmt::Debug;
use std::str::FromStr;

use strum_macros::EnumString;

use crate::util::constants::*;

/// Which heuristic drives trigger and collection-set decisions.
#[derive(Copy, Clone, EnumString, Debug, PartialEq, Eq)]
pub enum HeuristicsSelector {
    /// Allocation-rate driven triggering with garbage-first region selection.
    Adaptive,
    /// Trigger on a fixed free-threshold only. Mostly useful in tests.
    Static,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

/// An option of a given type, with a validator and provenance control.
#[derive(Clone)]
pub struct GcOption<T: Debug + Clone> {
    value: T,
    validator: fn(&T) -> bool,
    from_env_var: bool,
    from_command_line: bool,
}

impl<T: Debug + Clone> GcOption<T> {
    pub fn new(
        value: T,
        validator: fn(&T) -> bool,
        from_env_var: bool,
        from_command_line: bool,
    ) -> Self {
        GcOption {
            value,
            validator,
            from_env_var,
            from_command_line,
        }
    }

    /// Set the option. Returns false (and leaves the value unchanged) if the
    /// new value fails validation.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

impl<T: Debug + Clone> std::ops::Deref for GcOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

macro_rules! options {
    (@verify_set_from($self: expr, $key: expr, $verify_field: ident, $($name: ident),*)) => {
        match $key {
            $(stringify!($name) => { assert!($self.$name.$verify_field, "cannot set option {} (not {})", $key, stringify!($verify_field)) }),*
            _ => panic!("Invalid Options key: {}", $key)
        }
    };

    ($($(#[$outer:meta])*$name:ident: $type:ty [env_var: $env_var:expr, command_line: $command_line:expr] [$validator:expr] = $default:expr),*,) => [
        /// The set of options for one collector instance.
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: GcOption<$type>),*
        }

        impl Options {
            /// Set an option from an env var.
            pub fn set_from_env_var(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_env_var, $($name),*));
                self.set_inner(s, val)
            }

            /// Set an option from the command line / embedder API.
            pub fn set_from_command_line(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_command_line, $($name),*));
                self.set_inner(s, val)
            }

            /// Bulk process options: key value pairs separated by whitespace or
            /// commas, e.g. `threads=2 evac_reserve_percent=10`. Returns true
            /// only if every pair parses, validates, and is applied.
            pub fn set_bulk_from_command_line(&mut self, options: &str) -> bool {
                for opt in options.replace(',', " ").split_ascii_whitespace() {
                    let kv_pair: Vec<&str> = opt.split('=').collect();
                    if kv_pair.len() != 2 {
                        return false;
                    }
                    if !self.set_from_command_line(kv_pair[0], kv_pair[1]) {
                        return false;
                    }
                }
                true
            }

            fn set_inner(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(typed_val) = val.parse::<$type>() {
                        let is_set = self.$name.set(typed_val);
                        if !is_set {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_set
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Can't parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }

            fn new() -> Self {
                Options {
                    $($name: GcOption::new($default, $validator, $env_var, $command_line)),*
                }
            }

            /// Read `VELDT_`-prefixed environment variables and apply them.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "VELDT_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_env_var(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }

        impl Default for Options {
            fn default() -> Self {
                Self::new()
            }
        }
    ]
}

/// Default heap size: half of physical memory, clamped to a sane window.
/// Tests and embedders are expected to set `heap_size` explicitly.
fn default_heap_size() -> usize {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::nothing().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    let half_phys = (sys.total_memory() / 2) as usize;
    half_phys.clamp(64 * BYTES_IN_MBYTE, 4096 * BYTES_IN_MBYTE)
}

fn valid_region_size(v: &usize) -> bool {
    v.is_power_of_two() && (MIN_REGION_BYTES..=MAX_REGION_BYTES).contains(v)
}

fn valid_percent(v: &usize) -> bool {
    *v <= 100
}

fn valid_ratio_percent(v: &usize) -> bool {
    *v < 100
}

fn valid_waste(v: &f64) -> bool {
    *v >= 1.0
}

options! {
    // Which heuristic to use for trigger and collection-set decisions.
    heuristics:             HeuristicsSelector [env_var: true, command_line: true] [always_valid] = HeuristicsSelector::Adaptive,
    // Number of GC worker threads. (There is always one control thread and one VM-operation thread.)
    threads:                usize   [env_var: true, command_line: true] [|v: &usize| *v > 0] = num_cpus::get(),
    // Heap size in bytes. Rounded down to a whole number of regions.
    heap_size:              usize   [env_var: true, command_line: true] [|v: &usize| *v >= MIN_REGION_BYTES] = default_heap_size(),
    // Region size in bytes. Must be a power of two between 128K and 32M.
    region_size:            usize   [env_var: true, command_line: true] [valid_region_size] = DEFAULT_REGION_BYTES,
    // Maximum young generation capacity, as a percentage of the heap.
    young_percent:          usize   [env_var: true, command_line: true] [valid_percent] = 50,
    // Percentage of young capacity reserved as the evacuation ceiling.
    evac_reserve_percent:   usize   [env_var: true, command_line: true] [valid_percent] = 5,
    // Old evacuation share of the total evacuation budget: OldEvac / (OldEvac + YoungEvac).
    old_evac_ratio_percent: usize   [env_var: true, command_line: true] [valid_ratio_percent] = 75,
    // Minimum whole regions reserved in old for compaction.
    old_compaction_reserve: usize   [env_var: true, command_line: true] [always_valid] = 8,
    // Slack multiplier for young evacuation (fragmentation allowance).
    evac_waste:             f64     [env_var: true, command_line: true] [valid_waste] = 1.2,
    // Slack multiplier for promotion.
    promo_evac_waste:       f64     [env_var: true, command_line: true] [valid_waste] = 1.2,
    // Slack multiplier for old evacuation.
    old_evac_waste:         f64     [env_var: true, command_line: true] [valid_waste] = 1.4,
    // Lower bound on old generation growth before old marking is worthwhile,
    // as a percentage of old capacity.
    min_old_gen_growth_percent: f64 [env_var: true, command_line: true] [|v: &f64| *v >= 0.0 && *v <= 100.0] = 12.5,
    // Garbage percentage above which a region becomes a collection candidate.
    garbage_threshold_percent: usize [env_var: true, command_line: true] [valid_percent] = 25,
    // If immediate garbage is at least this share of total garbage, skip
    // evacuation entirely (abbreviated cycle).
    immediate_garbage_threshold_percent: usize [env_var: true, command_line: true] [valid_percent] = 90,
    // Adaptive trigger: start a cycle when free drops below this percentage
    // of generation capacity.
    min_free_threshold_percent: usize [env_var: true, command_line: true] [valid_percent] = 10,
    // Adaptive trigger: headroom multiplier applied to the observed
    // allocation rate when predicting time-to-exhaustion.
    alloc_spike_factor:     f64     [env_var: true, command_line: true] [|v: &f64| *v >= 1.0] = 1.5,
    // Region age at which surviving young regions become promotion candidates.
    tenuring_age:           usize   [env_var: true, command_line: true] [|v: &usize| *v > 0] = 7,
    // Aged regions at least this percent live are promoted in place instead
    // of being copied.
    in_place_promotion_live_percent: usize [env_var: true, command_line: true] [valid_percent] = 90,
    // Upper bound on idle time before the heuristic forces a cycle, in ms.
    guaranteed_gc_interval_ms: u64  [env_var: true, command_line: true] [always_valid] = 5 * 60 * 1000,
    // Control loop minimum sleep, in ms.
    control_interval_min_ms: u64    [env_var: true, command_line: true] [|v: &u64| *v > 0] = 1,
    // Control loop maximum sleep, in ms.
    control_interval_max_ms: u64    [env_var: true, command_line: true] [|v: &u64| *v > 0] = 10,
    // Double the control loop sleep after this much idleness, in ms.
    control_interval_adjust_period_ms: u64 [env_var: true, command_line: true] [|v: &u64| *v > 0] = 1000,
    // Consecutive no-progress degenerated cycles before upgrading to full GC.
    full_gc_threshold:      usize   [env_var: true, command_line: true] [|v: &usize| *v > 0] = 2,
    // Force the clear-all soft reference policy on every cycle.
    always_clear_soft_refs: bool    [env_var: true, command_line: true] [always_valid] = false,
    // Permit returning free regions to the OS.
    uncommit:               bool    [env_var: true, command_line: true] [always_valid] = true,
    // Permit degenerated STW fallback before full GC.
    degenerated_gc:         bool    [env_var: true, command_line: true] [always_valid] = true,
    // Enable verifier passes inside GC safepoints.
    verify:                 bool    [env_var: true, command_line: true] [always_valid] = false,
    // Run the verifier before each collection.
    verify_before_gc:       bool    [env_var: true, command_line: true] [always_valid] = false,
    // Run the verifier after each collection.
    verify_after_gc:        bool    [env_var: true, command_line: true] [always_valid] = false,
    // Collect remembered-set card-scan diagnostics.
    card_stats:             bool    [env_var: true, command_line: true] [always_valid] = false,
}

impl Options {
    /// Capacity granted to young at startup, in whole regions.
    pub fn young_capacity(&self, heap_size: usize) -> usize {
        let young = heap_size / 100 * *self.young_percent;
        crate::util::conversions::raw_align_down(young.max(*self.region_size), *self.region_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = Options::default();
        assert!(valid_region_size(&*options.region_size));
        assert!(*options.evac_waste >= 1.0);
        assert_eq!(*options.full_gc_threshold, 2);
    }

    #[test]
    fn bulk_parsing() {
        let mut options = Options::default();
        assert!(options.set_bulk_from_command_line("threads=3,evac_reserve_percent=10"));
        assert_eq!(*options.threads, 3);
        assert_eq!(*options.evac_reserve_percent, 10);
        // Bad pairs are rejected wholesale.
        assert!(!options.set_bulk_from_command_line("threads"));
        assert!(!options.set_bulk_from_command_line("threads=0"));
        assert!(!options.set_bulk_from_command_line("region_size=12345"));
    }

    #[test]
    fn enum_options_parse() {
        let mut options = Options::default();
        assert!(options.set_from_command_line("heuristics", "Static"));
        assert_eq!(*options.heuristics, HeuristicsSelector::Static);
    }
}
