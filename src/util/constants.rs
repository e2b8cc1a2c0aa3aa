//! Fundamental constants for heap geometry.

use static_assertions::const_assert;

/// log2 of the number of bytes in a word.
pub const LOG_BYTES_IN_WORD: usize = 3;
/// Bytes in a machine word. The collector assumes a 64-bit target.
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

pub const LOG_BYTES_IN_KBYTE: usize = 10;
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;
pub const LOG_BYTES_IN_MBYTE: usize = 20;
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the bytes covered by one remembered-set card.
///
/// Fixed at 512 bytes. Making this a runtime choice interacts with the
/// object-start table, so it stays a compile-time constant.
pub const LOG_CARD_BYTES: usize = 9;
/// Bytes covered by one card.
pub const CARD_BYTES: usize = 1 << LOG_CARD_BYTES;
/// Words covered by one card.
pub const CARD_WORDS: usize = CARD_BYTES >> LOG_BYTES_IN_WORD;

/// Smallest supported region size.
pub const MIN_REGION_BYTES: usize = 128 * BYTES_IN_KBYTE;
/// Largest supported region size.
pub const MAX_REGION_BYTES: usize = 32 * BYTES_IN_MBYTE;
/// Default region size.
pub const DEFAULT_REGION_BYTES: usize = 256 * BYTES_IN_KBYTE;

/// Cards must partition a region exactly.
const_assert!(MIN_REGION_BYTES % CARD_BYTES == 0);
const_assert!(MIN_REGION_BYTES.is_power_of_two());
const_assert!(MAX_REGION_BYTES.is_power_of_two());

/// How many cards a remembered-set scan chunk claims at a time.
pub const RSET_CHUNK_CARDS: usize = 64;

/// How many mark tasks a worker drains between cancellation polls.
pub const MARK_POLL_STRIDE: usize = 64;

/// Capacity of a mutator SATB buffer, in entries.
pub const SATB_BUFFER_CAPACITY: usize = 1024;
