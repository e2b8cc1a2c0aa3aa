//! Backing store for the heap: one contiguous anonymous mapping.

use crate::util::address::Address;

/// The heap backing store. Reserved once at startup; regions commit and
/// uncommit pieces of it.
pub struct BackingStore {
    start: Address,
    size: usize,
}

// The mapping itself is plain memory; synchronization of its contents is the
// collector's job.
unsafe impl Send for BackingStore {}
unsafe impl Sync for BackingStore {}

impl BackingStore {
    /// Reserve and commit `size` bytes, aligned to `align`.
    pub fn new(size: usize, align: usize) -> BackingStore {
        debug_assert!(align.is_power_of_two());
        // Over-reserve so we can align, then keep the aligned window. We do
        // not bother trimming the slack; it stays untouched and unpaged.
        let reserve = size + align;
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserve,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        assert!(
            raw != libc::MAP_FAILED,
            "Failed to reserve {} bytes for the heap",
            reserve
        );
        let start = Address::from_ptr(raw).align_up(align);
        BackingStore { start, size }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.start + self.size
    }

    /// Hint to the OS that `[start, start+len)` is no longer needed. The
    /// range stays mapped; the next touch re-commits it as zero pages.
    pub fn uncommit(&self, start: Address, len: usize) {
        debug_assert!(self.contains(start));
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let ret = unsafe { libc::madvise(start.to_mut_ptr(), len, libc::MADV_DONTNEED) };
                debug_assert_eq!(ret, 0, "madvise(MADV_DONTNEED) failed");
            } else {
                let ret = unsafe { libc::madvise(start.to_mut_ptr(), len, libc::MADV_FREE) };
                debug_assert_eq!(ret, 0, "madvise(MADV_FREE) failed");
            }
        }
    }

    /// Zero a range. Used when recycling trash regions.
    pub fn zero(&self, start: Address, len: usize) {
        debug_assert!(self.contains(start));
        unsafe {
            std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_mapping() {
        let store = BackingStore::new(1 << 20, 1 << 16);
        assert!(store.start().is_aligned_to(1 << 16));
        assert!(store.contains(store.start()));
        assert!(store.contains(store.start() + ((1 << 20) - 1)));
        store.zero(store.start(), 4096);
        unsafe {
            store.start().store::<usize>(42);
            assert_eq!(store.start().load::<usize>(), 42);
        }
        store.uncommit(store.start(), 4096);
    }
}
