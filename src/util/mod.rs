//! Shared utilities: addresses, geometry constants, conversions, the backing
//! store, options, logging, and phase timing.

pub mod address;
pub mod constants;
pub mod conversions;
pub(crate) mod logger;
pub mod memory;
pub mod options;
pub mod phase_times;
pub mod test_util;

pub use address::{Address, ObjectReference};
