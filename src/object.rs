//! The minimal heap object model.
//!
//! An object is a header followed by reference slots followed by raw payload
//! words:
//!
//! ```text
//! word 0   status word: forwarding state (low 2 bits) + forwardee address
//! word 1   size of the whole object, in words
//! word 2   kind (low 3 bits) + flag bits
//! word 3   number of reference slots
//! word 4.. reference slots, then payload
//! ```
//!
//! Reference-kind objects (soft/weak/final/phantom) use their first three
//! slots for `referent`, `discovered` and `next`. The `discovered` and `next`
//! slots belong to the reference processor and are never traced.

use std::sync::atomic::Ordering;

use crate::util::address::{load_slot, store_slot, Address, ObjectReference};
use crate::util::constants::{BYTES_IN_WORD, LOG_BYTES_IN_WORD};

/// Words occupied by the object header.
pub const HEADER_WORDS: usize = 4;
/// Smallest possible object, in words.
pub const MIN_OBJECT_WORDS: usize = HEADER_WORDS;

const STATUS_OFFSET: usize = 0;
const SIZE_OFFSET: usize = BYTES_IN_WORD;
const KIND_OFFSET: usize = 2 * BYTES_IN_WORD;
const REF_COUNT_OFFSET: usize = 3 * BYTES_IN_WORD;

// Forwarding states, kept in the low two bits of the status word.
const FORWARDING_MASK: usize = 0b11;
const UNFORWARDED: usize = 0b00;
const BEING_FORWARDED: usize = 0b10;
const FORWARDED: usize = 0b11;

const KIND_MASK: usize = 0b111;
/// Set once a reference object has been processed (its `next` made
/// meaningful); inactive references are never re-discovered.
const FLAG_INACTIVE: usize = 1 << 3;
/// Set when a FINAL reference's referent has received its one extra mark.
const FLAG_FINALIZED: usize = 1 << 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    Regular = 0,
    Soft = 1,
    Weak = 2,
    Final = 3,
    Phantom = 4,
    /// Dead span overwritten by coalesce-and-fill. Never traced, never live.
    Filler = 5,
}

impl ObjectKind {
    fn from_bits(bits: usize) -> ObjectKind {
        match bits & KIND_MASK {
            0 => ObjectKind::Regular,
            1 => ObjectKind::Soft,
            2 => ObjectKind::Weak,
            3 => ObjectKind::Final,
            4 => ObjectKind::Phantom,
            5 => ObjectKind::Filler,
            k => unreachable!("corrupt object kind bits: {}", k),
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(
            self,
            ObjectKind::Soft | ObjectKind::Weak | ObjectKind::Final | ObjectKind::Phantom
        )
    }
}

/// Write a fresh header. `size_words` covers header + slots + payload;
/// `ref_slots` must fit, and reference kinds need at least the three
/// bookkeeping slots.
pub fn initialize(addr: Address, size_words: usize, ref_slots: usize, kind: ObjectKind) -> ObjectReference {
    debug_assert!(size_words >= HEADER_WORDS + ref_slots);
    debug_assert!(!kind.is_reference() || ref_slots >= 3);
    unsafe {
        (addr + STATUS_OFFSET).store::<usize>(UNFORWARDED);
        (addr + SIZE_OFFSET).store::<usize>(size_words);
        (addr + KIND_OFFSET).store::<usize>(kind as usize);
        (addr + REF_COUNT_OFFSET).store::<usize>(ref_slots);
        // Null out the reference slots; payload is left as-is (regions are
        // zeroed on recycle).
        for i in 0..ref_slots {
            (addr + (HEADER_WORDS + i) * BYTES_IN_WORD).store::<usize>(0);
        }
    }
    ObjectReference::from_address(addr)
}

/// Write a filler object over a dead span.
pub fn initialize_filler(addr: Address, size_words: usize) -> ObjectReference {
    debug_assert!(size_words >= MIN_OBJECT_WORDS);
    unsafe {
        (addr + STATUS_OFFSET).store::<usize>(UNFORWARDED);
        (addr + SIZE_OFFSET).store::<usize>(size_words);
        (addr + KIND_OFFSET).store::<usize>(ObjectKind::Filler as usize);
        (addr + REF_COUNT_OFFSET).store::<usize>(0);
    }
    ObjectReference::from_address(addr)
}

pub fn size_words(obj: ObjectReference) -> usize {
    unsafe { (obj.to_address() + SIZE_OFFSET).load::<usize>() }
}

pub fn size_bytes(obj: ObjectReference) -> usize {
    size_words(obj) << LOG_BYTES_IN_WORD
}

pub fn kind(obj: ObjectReference) -> ObjectKind {
    ObjectKind::from_bits(unsafe { (obj.to_address() + KIND_OFFSET).load::<usize>() })
}

pub fn ref_slot_count(obj: ObjectReference) -> usize {
    unsafe { (obj.to_address() + REF_COUNT_OFFSET).load::<usize>() }
}

/// Address of reference slot `i`.
pub fn ref_slot(obj: ObjectReference, i: usize) -> Address {
    debug_assert!(i < ref_slot_count(obj));
    obj.to_address() + (HEADER_WORDS + i) * BYTES_IN_WORD
}

pub fn get_ref(obj: ObjectReference, i: usize) -> Option<ObjectReference> {
    load_slot(ref_slot(obj, i))
}

pub fn set_ref(obj: ObjectReference, i: usize, value: Option<ObjectReference>) {
    store_slot(ref_slot(obj, i), value);
}

/// Address of the first payload word (after the reference slots).
pub fn payload(obj: ObjectReference) -> Address {
    obj.to_address() + (HEADER_WORDS + ref_slot_count(obj)) * BYTES_IN_WORD
}

/// End address (exclusive) of the object.
pub fn end(obj: ObjectReference) -> Address {
    obj.to_address() + size_bytes(obj)
}

// Reference-object bookkeeping slots.

pub const REFERENT_SLOT: usize = 0;
pub const DISCOVERED_SLOT: usize = 1;
pub const NEXT_SLOT: usize = 2;
/// First slot holding an ordinary strong reference in a reference object.
pub const REFERENCE_STRONG_SLOTS: usize = 3;

fn flags_word(obj: ObjectReference) -> &'static std::sync::atomic::AtomicUsize {
    unsafe { (obj.to_address() + KIND_OFFSET).as_atomic() }
}

pub fn is_inactive(obj: ObjectReference) -> bool {
    flags_word(obj).load(Ordering::Acquire) & FLAG_INACTIVE != 0
}

pub fn make_inactive(obj: ObjectReference) {
    flags_word(obj).fetch_or(FLAG_INACTIVE, Ordering::AcqRel);
}

pub fn is_finalized(obj: ObjectReference) -> bool {
    flags_word(obj).load(Ordering::Acquire) & FLAG_FINALIZED != 0
}

pub fn set_finalized(obj: ObjectReference) {
    flags_word(obj).fetch_or(FLAG_FINALIZED, Ordering::AcqRel);
}

// Forwarding protocol. Exactly one claimant wins the right to copy an object;
// everyone else spins for the forwardee. The GC worker CAS and the load
// barrier CAS go through the same path.

fn status_word(obj: ObjectReference) -> &'static std::sync::atomic::AtomicUsize {
    unsafe { (obj.to_address() + STATUS_OFFSET).as_atomic() }
}

pub enum ForwardingAttempt {
    /// The caller owns the object and must call [`set_forwardee`].
    Winner,
    /// Somebody else is copying (or has copied) the object.
    Lost,
}

pub fn is_forwarded(obj: ObjectReference) -> bool {
    status_word(obj).load(Ordering::Acquire) & FORWARDING_MASK == FORWARDED
}

pub fn attempt_to_forward(obj: ObjectReference) -> ForwardingAttempt {
    match status_word(obj).compare_exchange(
        UNFORWARDED,
        BEING_FORWARDED,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => ForwardingAttempt::Winner,
        Err(_) => ForwardingAttempt::Lost,
    }
}

/// Publish the forwardee. Only the thread that won [`attempt_to_forward`]
/// may call this.
pub fn set_forwardee(obj: ObjectReference, to: ObjectReference) {
    debug_assert!(to.to_address().is_aligned_to(BYTES_IN_WORD));
    debug_assert_eq!(
        status_word(obj).load(Ordering::Relaxed) & FORWARDING_MASK,
        BEING_FORWARDED
    );
    status_word(obj).store(to.as_usize() | FORWARDED, Ordering::Release);
}

/// Publish `to` as the forwardee of `obj` in one step. Used by evacuation,
/// which allocates and copies first: on failure the loser gets the winner's
/// forwardee back and abandons its own copy. Unlike [`attempt_to_forward`],
/// the object is never observed in the transient BEING_FORWARDED state.
pub fn try_install_forwardee(
    obj: ObjectReference,
    to: ObjectReference,
) -> Result<(), ObjectReference> {
    match status_word(obj).compare_exchange(
        UNFORWARDED,
        to.as_usize() | FORWARDED,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Ok(()),
        Err(_) => Err(spin_and_get_forwarded(obj)),
    }
}

/// Wait out a concurrent copy and return the forwardee.
pub fn spin_and_get_forwarded(obj: ObjectReference) -> ObjectReference {
    loop {
        let status = status_word(obj).load(Ordering::Acquire);
        if status & FORWARDING_MASK == FORWARDED {
            return ObjectReference::from_address(unsafe {
                Address::from_usize(status & !FORWARDING_MASK)
            });
        }
        std::hint::spin_loop();
    }
}

/// The forwardee if forwarded, otherwise the object itself.
pub fn resolve(obj: ObjectReference) -> ObjectReference {
    let status = status_word(obj).load(Ordering::Acquire);
    if status & FORWARDING_MASK == FORWARDED {
        ObjectReference::from_address(unsafe { Address::from_usize(status & !FORWARDING_MASK) })
    } else {
        obj
    }
}

/// Bit-copy the object to `dst` and return the new reference. The copy's
/// status word is reset; the original still carries BEING_FORWARDED until
/// [`set_forwardee`] publishes the copy.
pub fn copy_to(obj: ObjectReference, dst: Address) -> ObjectReference {
    let bytes = size_bytes(obj);
    unsafe {
        std::ptr::copy_nonoverlapping(
            obj.to_address().to_ptr::<u8>(),
            dst.to_mut_ptr::<u8>(),
            bytes,
        );
        (dst + STATUS_OFFSET).store::<usize>(UNFORWARDED);
    }
    ObjectReference::from_address(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(words: usize) -> (Vec<usize>, Address) {
        let buf = vec![0usize; words];
        let addr = Address::from_ptr(buf.as_ptr());
        (buf, addr)
    }

    #[test]
    fn header_roundtrip() {
        let (_buf, addr) = scratch(16);
        let obj = initialize(addr, 10, 2, ObjectKind::Regular);
        assert_eq!(size_words(obj), 10);
        assert_eq!(ref_slot_count(obj), 2);
        assert_eq!(kind(obj), ObjectKind::Regular);
        assert_eq!(get_ref(obj, 0), None);
        assert_eq!(end(obj), addr + 80usize);
    }

    #[test]
    fn forwarding_protocol() {
        let (_buf, addr) = scratch(8);
        let (_buf2, to_addr) = scratch(8);
        let obj = initialize(addr, 8, 0, ObjectKind::Regular);
        assert!(!is_forwarded(obj));
        assert!(matches!(attempt_to_forward(obj), ForwardingAttempt::Winner));
        assert!(matches!(attempt_to_forward(obj), ForwardingAttempt::Lost));
        let copy = copy_to(obj, to_addr);
        set_forwardee(obj, copy);
        assert!(is_forwarded(obj));
        assert_eq!(resolve(obj), copy);
        assert_eq!(spin_and_get_forwarded(obj), copy);
        assert!(!is_forwarded(copy));
        assert_eq!(size_words(copy), 8);
    }

    #[test]
    fn reference_flags() {
        let (_buf, addr) = scratch(16);
        let obj = initialize(addr, 12, 3, ObjectKind::Weak);
        assert!(kind(obj).is_reference());
        assert!(!is_inactive(obj));
        make_inactive(obj);
        assert!(is_inactive(obj));
        assert_eq!(kind(obj), ObjectKind::Weak);
    }

    #[test]
    fn filler_covers_span() {
        let (_buf, addr) = scratch(8);
        let filler = initialize_filler(addr, 8);
        assert_eq!(kind(filler), ObjectKind::Filler);
        assert_eq!(size_words(filler), 8);
        assert_eq!(ref_slot_count(filler), 0);
    }
}
