use std::ptr;

use crate::{align::align_up, host};

/// Chunk size drawn from the host allocator.
const CHUNK_SIZE: usize = 64 * 1024;

/// Requests above this start their own host allocation instead of eating a
/// fresh chunk.
const DIRECT_THRESHOLD: usize = 4096;

/// Append-only bump allocator for bookkeeping that lives as long as the
/// process: thread ids, registries, anything callers park behind
/// [`crate::static_alloc`]. Hands out 8-byte aligned slices of 64 KiB host
/// chunks and never frees; when a chunk can't fit a request the remainder
/// is simply abandoned. One of these lives in every thread front end.
pub(crate) struct StaticAllocator {
    cursor: *mut u8,
    end: *mut u8,
}

impl StaticAllocator {
    pub const fn new() -> Self {
        Self {
            cursor: ptr::null_mut(),
            end: ptr::null_mut(),
        }
    }

    /// Returns `n` bytes (rounded up to 8), or null if the host is out of
    /// memory. The result is never freed.
    pub fn alloc(&mut self, n: usize) -> *mut u8 {
        let n = align_up(n, 8);

        if n <= self.end as usize - self.cursor as usize {
            return self.bump(n);
        }

        if n <= DIRECT_THRESHOLD {
            let chunk = unsafe { host::malloc(CHUNK_SIZE) };
            if chunk.is_null() {
                return ptr::null_mut();
            }
            self.cursor = chunk;
            self.end = unsafe { chunk.add(CHUNK_SIZE) };
            return self.bump(n);
        }

        unsafe { host::malloc(n) }
    }

    #[inline]
    fn bump(&mut self, n: usize) -> *mut u8 {
        let address = self.cursor;
        self.cursor = unsafe { address.add(n) };
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests leak by design: the allocator under test never frees.

    #[test]
    #[cfg_attr(miri, ignore)]
    fn bumps_are_aligned_and_disjoint() {
        let mut bump = StaticAllocator::new();

        let a = bump.alloc(3);
        let b = bump.alloc(13);
        let c = bump.alloc(8);
        for p in [a, b, c] {
            assert!(!p.is_null());
            assert_eq!(p as usize % 8, 0);
        }
        assert_eq!(b as usize - a as usize, 8);
        assert_eq!(c as usize - b as usize, 16);

        unsafe {
            a.write_bytes(0x11, 3);
            b.write_bytes(0x22, 13);
            c.write_bytes(0x33, 8);
            assert_eq!(*a, 0x11);
            assert_eq!(*b, 0x22);
            assert_eq!(*c, 0x33);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn rolls_over_to_a_fresh_chunk() {
        let mut bump = StaticAllocator::new();

        // Drain a whole chunk with maximum chunk-eligible requests.
        for _ in 0..CHUNK_SIZE / DIRECT_THRESHOLD {
            assert!(!bump.alloc(DIRECT_THRESHOLD).is_null());
        }

        // The next request lands at the start of a fresh chunk with its
        // full capacity behind it.
        let first = bump.alloc(16);
        let second = bump.alloc(8);
        assert!(!first.is_null());
        assert_eq!(second as usize - first as usize, 16);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn big_requests_go_straight_to_the_host() {
        let mut bump = StaticAllocator::new();

        let small = bump.alloc(64);
        let big = bump.alloc(DIRECT_THRESHOLD + 1);
        assert!(!big.is_null());
        // The current chunk is untouched by the direct allocation.
        let next = bump.alloc(64);
        assert_eq!(next as usize - small as usize, 64);
    }
}
