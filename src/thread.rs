use std::{
    cell::Cell,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    align::align_up,
    arena::ARENA,
    block::LargeBlock,
    bump::StaticAllocator,
    header::Header,
    host,
    large::{LargeAlloc, LARGE_CELL_SHIFT, LARGE_CELL_SIZE},
    list::LinkedList,
    small::{SmallAlloc, SMALL_CELL_SHIFT, SMALL_CELL_SIZE},
    LARGE_BLOCK_SIZE, MAX_POOL_ALLOC, MAX_SMALL_ALLOC, SMALL_BLOCK_SIZE,
};

/// Secondary small slabs probed (with a foreign-free drain) before minting
/// a new one.
const SMALL_SCAN_LIMIT: usize = 2;

/// Secondary large slabs probed before minting a new one.
const LARGE_SCAN_LIMIT: usize = 4;

/// Secondary large blocks asked for a fresh small slot before going to the
/// arena.
const BLOCK_SCAN_LIMIT: usize = 4;

/// Process-wide front-end id counter. The id keys the arena shard.
static NEXT_ID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    // Const-initialized and droppable-free, so access never allocates and
    // no TLS destructor runs: both properties matter when this crate is
    // the global allocator.
    static CURRENT: Cell<*mut ThreadAlloc> = const { Cell::new(ptr::null_mut()) };
}

/// The calling thread's front end, created on first use and never
/// destroyed. Its blocks drain back to the arena through the ordinary free
/// path; whatever a thread still holds when it exits is reclaimed with the
/// process. Null only if the host allocator refused the few hundred bytes
/// of bootstrap storage.
pub(crate) fn current() -> *mut ThreadAlloc {
    CURRENT.with(|cell| {
        let mut ta = cell.get();
        if ta.is_null() {
            ta = ThreadAlloc::boot();
            cell.set(ta);
        }
        ta
    })
}

/// Per-thread front end: the active slab of each class plus the lists of
/// secondary ones. The head of each list is the warm allocator the fast
/// path hits; allocators that empty while *not* at the head are handed
/// back to their parent, so a thread hovering around empty keeps exactly
/// one warm slab per class instead of thrashing the arena.
pub(crate) struct ThreadAlloc {
    /// Small-class slabs; head is active.
    small: LinkedList<SmallAlloc>,
    /// Large-class slabs; head is active.
    large: LinkedList<LargeAlloc>,
    /// Large blocks that small slabs are minted from; head is active.
    blocks: LinkedList<LargeBlock>,
    /// Arena shard key, unique per front end.
    id: u32,
    /// Never-freed bookkeeping allocator.
    bump: StaticAllocator,
}

/// Request size to whole 16-byte cells. Zero-size requests take one cell.
#[inline]
fn small_cells(n: usize) -> u32 {
    (align_up(n.max(1), SMALL_CELL_SIZE) >> SMALL_CELL_SHIFT) as u32
}

/// Request size to whole page cells.
#[inline]
fn large_cells(n: usize) -> u32 {
    (align_up(n, LARGE_CELL_SIZE) >> LARGE_CELL_SHIFT) as u32
}

impl ThreadAlloc {
    fn new() -> Self {
        Self {
            small: LinkedList::new(),
            large: LinkedList::new(),
            blocks: LinkedList::new(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            bump: StaticAllocator::new(),
        }
    }

    /// Host-allocates a fresh front end for the calling thread.
    fn boot() -> *mut ThreadAlloc {
        let ta = unsafe { host::malloc(mem::size_of::<ThreadAlloc>()) } as *mut ThreadAlloc;
        if !ta.is_null() {
            unsafe { ta.write(ThreadAlloc::new()) };
        }
        ta
    }

    /// Never-freed bookkeeping allocation.
    pub fn static_alloc(&mut self, n: usize) -> *mut u8 {
        self.bump.alloc(n)
    }

    /// Allocates `n` bytes, routed by size class. Null on OOM.
    pub unsafe fn alloc(&mut self, n: usize) -> *mut u8 {
        if n <= MAX_SMALL_ALLOC {
            self.alloc_small(small_cells(n))
        } else if n <= MAX_POOL_ALLOC {
            self.alloc_large(large_cells(n))
        } else {
            host::malloc(n)
        }
    }

    unsafe fn alloc_small(&mut self, cells: u32) -> *mut u8 {
        if let Some(sa) = self.small.first() {
            let p = Header::<SmallAlloc>::alloc(sa, cells);
            if !p.is_null() {
                return p;
            }

            // The active slab is full; secondary slabs may have pending
            // foreign frees worth folding in.
            let mut next = sa.as_ref().next;
            let mut probed = 0;
            while let Some(candidate) = next {
                if probed == SMALL_SCAN_LIMIT {
                    break;
                }
                let p = Header::<SmallAlloc>::try_hard_alloc(candidate, cells);
                if !p.is_null() {
                    self.small.move_to_front(candidate);
                    return p;
                }
                next = candidate.as_ref().next;
                probed += 1;
            }
        }

        let owner: *mut ThreadAlloc = self;

        // Mint a new slab, preferably from the active large block.
        if let Some(lb) = self.blocks.first() {
            if let Some(sa) = Header::<LargeBlock>::make_small_alloc(lb, owner) {
                self.small.push_front(sa);
                return Header::<SmallAlloc>::alloc(sa, cells);
            }

            let mut next = lb.as_ref().next;
            let mut probed = 0;
            while let Some(candidate) = next {
                if probed == BLOCK_SCAN_LIMIT {
                    break;
                }
                if let Some(sa) = Header::<LargeBlock>::make_small_alloc(candidate, owner) {
                    self.blocks.move_to_front(candidate);
                    self.small.push_front(sa);
                    return Header::<SmallAlloc>::alloc(sa, cells);
                }
                next = candidate.as_ref().next;
                probed += 1;
            }
        }

        // Every block this thread holds is out of slots: get a fresh one
        // from the arena.
        let Some(lb) = ARENA.make_large_block(self.id) else {
            return ptr::null_mut();
        };
        self.blocks.push_front(lb);

        // A fresh block always has a free slot.
        let Some(sa) = Header::<LargeBlock>::make_small_alloc(lb, owner) else {
            return ptr::null_mut();
        };
        self.small.push_front(sa);
        Header::<SmallAlloc>::alloc(sa, cells)
    }

    unsafe fn alloc_large(&mut self, cells: u32) -> *mut u8 {
        if let Some(la) = self.large.first() {
            let p = Header::<LargeAlloc>::alloc(la, cells);
            if !p.is_null() {
                return p;
            }

            let mut next = la.as_ref().next;
            let mut probed = 0;
            while let Some(candidate) = next {
                if probed == LARGE_SCAN_LIMIT {
                    break;
                }
                let p = Header::<LargeAlloc>::try_hard_alloc(candidate, cells);
                if !p.is_null() {
                    self.large.move_to_front(candidate);
                    return p;
                }
                next = candidate.as_ref().next;
                probed += 1;
            }
        }

        let owner: *mut ThreadAlloc = self;
        let Some(la) = ARENA.make_large_alloc(self.id, owner) else {
            return ptr::null_mut();
        };
        self.large.push_front(la);
        Header::<LargeAlloc>::alloc(la, cells)
    }

    /// Frees `p`, where `n` is the size passed to the allocating call.
    /// Routed by size exactly as the allocation was. `this` may be null
    /// (a thread whose own front end failed to boot can still free): the
    /// owner comparison then routes every pool pointer down the foreign
    /// path, which touches no thread state.
    pub unsafe fn free(this: *mut ThreadAlloc, p: NonNull<u8>, n: usize) {
        if n <= MAX_SMALL_ALLOC {
            let sa: NonNull<Header<SmallAlloc>> = Header::from_cell_address(p, SMALL_BLOCK_SIZE);
            if Header::<SmallAlloc>::owner(sa) != this {
                Header::<SmallAlloc>::xfree(sa, p);
                return;
            }

            let ta = &mut *this;
            if Header::<SmallAlloc>::free(sa, p) && ta.small.first() != Some(sa) {
                // The slab emptied and isn't the warm head: give its slot
                // back to the large block, and cascade upward if that
                // empties a non-head block too.
                ta.small.remove(sa);
                let lb = Header::<SmallAlloc>::parent(sa);
                if Header::<LargeBlock>::free_slot(lb, sa.cast()) && ta.blocks.first() != Some(lb)
                {
                    ta.blocks.remove(lb);
                    ARENA.free_large_slot(lb.cast(), Header::<LargeBlock>::parent(lb), ta.id);
                }
            }
        } else if n <= MAX_POOL_ALLOC {
            let la: NonNull<Header<LargeAlloc>> = Header::from_cell_address(p, LARGE_BLOCK_SIZE);
            if Header::<LargeAlloc>::owner(la) != this {
                Header::<LargeAlloc>::xfree(la, p);
                return;
            }

            let ta = &mut *this;
            if Header::<LargeAlloc>::free(la, p) && ta.large.first() != Some(la) {
                ta.large.remove(la);
                ARENA.free_large_slot(la.cast(), Header::<LargeAlloc>::parent(la), ta.id);
            }
        } else {
            host::free(p.as_ptr(), n);
        }
    }

    /// Grows the allocation at `p` from `old` to `new` bytes (`new > old`;
    /// growing is the only direction the pools support in place). Returns
    /// `p` itself when the cell-rounded size already covers `new` or the
    /// slab could extend in place; otherwise allocates, copies `old` bytes
    /// and frees. Null on OOM, with `p` left intact.
    pub unsafe fn realloc(&mut self, p: NonNull<u8>, old: usize, new: usize) -> *mut u8 {
        if old > MAX_POOL_ALLOC {
            return host::realloc(p.as_ptr(), old, new);
        }

        debug_assert!(new > old, "realloc must grow");

        if old <= MAX_SMALL_ALLOC {
            let rounded = small_cells(old) as usize * SMALL_CELL_SIZE;
            if new <= rounded {
                return p.as_ptr();
            }

            let sa: NonNull<Header<SmallAlloc>> = Header::from_cell_address(p, SMALL_BLOCK_SIZE);
            if self.small.first() == Some(sa) && new <= MAX_SMALL_ALLOC {
                let grown =
                    Header::<SmallAlloc>::realloc(sa, p, small_cells(old), small_cells(new));
                if !grown.is_null() {
                    return grown;
                }
            }
        } else {
            let rounded = large_cells(old) as usize * LARGE_CELL_SIZE;
            if new <= rounded {
                return p.as_ptr();
            }

            let la: NonNull<Header<LargeAlloc>> = Header::from_cell_address(p, LARGE_BLOCK_SIZE);
            if self.large.first() == Some(la) && new <= MAX_POOL_ALLOC {
                let grown =
                    Header::<LargeAlloc>::realloc(la, p, large_cells(old), large_cells(new));
                if !grown.is_null() {
                    return grown;
                }
            }
        }

        let moved = self.alloc(new);
        if !moved.is_null() {
            ptr::copy_nonoverlapping(p.as_ptr(), moved, old);
            Self::free(self, p, old);
        }
        moved
    }

    #[cfg(test)]
    fn list_lengths(&self) -> (usize, usize, usize) {
        (self.small.len, self.blocks.len, self.large.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test drives a private front end directly instead of the
    // thread-local one so parallel tests don't share state. Real huge
    // reservations back these, hence no Miri.

    fn with_thread_alloc<R>(f: impl FnOnce(&mut ThreadAlloc) -> R) -> R {
        let ta = ThreadAlloc::boot();
        assert!(!ta.is_null());
        unsafe { f(&mut *ta) }
    }

    unsafe fn nn(p: *mut u8) -> NonNull<u8> {
        NonNull::new(p).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn small_churn_uses_one_slab_chain() {
        with_thread_alloc(|ta| unsafe {
            let count = 10_000;
            let size = 24;
            let mut pointers = Vec::with_capacity(count);

            for i in 0..count {
                let p = ta.alloc(size);
                assert!(!p.is_null());
                p.write_bytes((i & 0xFF) as u8, size);
                pointers.push(p);
            }

            // 24 bytes is 2 cells; a slab fits ~1000 of those, so this
            // churn stays within a handful of slabs in one large block.
            let (slabs, blocks, large) = ta.list_lengths();
            assert!(slabs >= 1);
            assert_eq!(blocks, 1);
            assert_eq!(large, 0);

            for (i, p) in pointers.iter().enumerate() {
                assert_eq!(*p.cast::<u8>(), (i & 0xFF) as u8);
                ThreadAlloc::free(ta, nn(*p), size);
            }

            // Everything freed: only the warm head slab and its block
            // remain.
            assert_eq!(ta.list_lengths(), (1, 1, 0));
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn routes_each_size_to_its_class() {
        with_thread_alloc(|ta| unsafe {
            let sizes = [8usize, 64, 2048, 4097, 131072];
            let pointers: Vec<*mut u8> = sizes.iter().map(|&n| ta.alloc(n)).collect();

            for (&n, &p) in sizes.iter().zip(&pointers) {
                assert!(!p.is_null());
                let align = if n <= MAX_SMALL_ALLOC {
                    SMALL_CELL_SIZE
                } else {
                    LARGE_CELL_SIZE
                };
                assert_eq!(p as usize % align, 0, "size {n} misaligned");
            }

            // The three small sizes share one slab.
            let small_base = pointers[0] as usize & !(SMALL_BLOCK_SIZE - 1);
            assert_eq!(pointers[1] as usize & !(SMALL_BLOCK_SIZE - 1), small_base);
            assert_eq!(pointers[2] as usize & !(SMALL_BLOCK_SIZE - 1), small_base);

            // Both large sizes share one page slab.
            let large_base = pointers[3] as usize & !(LARGE_BLOCK_SIZE - 1);
            assert_eq!(pointers[4] as usize & !(LARGE_BLOCK_SIZE - 1), large_base);
            // 131072 bytes occupies 32 pages directly after 4097's 2.
            assert_eq!(
                pointers[4] as usize - pointers[3] as usize,
                2 * LARGE_CELL_SIZE
            );

            assert_eq!(ta.list_lengths(), (1, 1, 1));

            for (&n, &p) in sizes.iter().zip(&pointers) {
                ThreadAlloc::free(ta, nn(p), n);
            }
            assert_eq!(ta.list_lengths(), (1, 1, 1));
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn oversize_bypasses_the_pools() {
        with_thread_alloc(|ta| unsafe {
            let n = 200_000;
            let p = ta.alloc(n);
            assert!(!p.is_null());
            p.write_bytes(0x7E, n);
            assert_eq!(*p.add(n - 1), 0x7E);

            ThreadAlloc::free(ta, nn(p), n);
            // No pool state was ever minted.
            assert_eq!(ta.list_lengths(), (0, 0, 0));
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn realloc_grows_in_place_then_moves() {
        with_thread_alloc(|ta| unsafe {
            let p = ta.alloc(32);
            p.write_bytes(0x42, 32);

            // Topmost allocation extends in place, twice.
            assert_eq!(ta.realloc(nn(p), 32, 42), p);
            assert_eq!(ta.realloc(nn(p), 42, 64), p);
            // The cell-rounded size already covers one more byte.
            assert_eq!(ta.realloc(nn(p), 63, 64), p);

            // Burying p forces the move path.
            let blocker = ta.alloc(16);
            let q = ta.realloc(nn(p), 64, 128);
            assert!(!q.is_null());
            assert_ne!(q, p);
            for i in 0..32 {
                assert_eq!(*q.add(i), 0x42, "byte {i} lost in the move");
            }

            ThreadAlloc::free(ta, nn(q), 128);
            ThreadAlloc::free(ta, nn(blocker), 16);
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn realloc_crossing_classes_copies() {
        with_thread_alloc(|ta| unsafe {
            let p = ta.alloc(2000);
            p.write_bytes(0x55, 2000);

            let q = ta.realloc(nn(p), 2000, 10_000);
            assert!(!q.is_null());
            assert_eq!(q as usize % LARGE_CELL_SIZE, 0);
            for i in [0usize, 999, 1999] {
                assert_eq!(*q.add(i), 0x55);
            }

            ThreadAlloc::free(ta, nn(q), 10_000);
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn slab_exhaustion_mints_a_second_slab() {
        with_thread_alloc(|ta| unsafe {
            // A 2048-byte request takes 128 cells: 15 of them drain a
            // slab's 2012 usable cells, so the 16th forces a second slab
            // from the same large block.
            let mut pointers = Vec::new();
            for _ in 0..16 {
                let p = ta.alloc(2048);
                assert!(!p.is_null());
                pointers.push(p);
            }

            let (slabs, blocks, _) = ta.list_lengths();
            assert_eq!(slabs, 2);
            assert_eq!(blocks, 1);

            for p in pointers {
                ThreadAlloc::free(ta, nn(p), 2048);
            }
            // The drained secondary slab was reclaimed; the head stays.
            assert_eq!(ta.list_lengths(), (1, 1, 0));
        });
    }
}
