use std::ptr::{self, NonNull};

use crate::{
    bitmap::Bitmap, block::LargeBlock, header::Header, thread::ThreadAlloc, SMALL_BLOCK_SIZE,
    WORD_SHIFT,
};

/// Small-class cells are 16 bytes; requests are rounded up to whole cells.
pub(crate) const SMALL_CELL_SHIFT: u32 = 4;
pub(crate) const SMALL_CELL_SIZE: usize = 1 << SMALL_CELL_SHIFT;

/// Number of cells a small block divides into.
const CELLS: u32 = (SMALL_BLOCK_SIZE >> SMALL_CELL_SHIFT) as u32;

/// Bytes set aside at the block start for the header struct.
const HEADER_SIZE: usize = 64;

/// The slab's own metadata is carved out of its first cells: the header,
/// then the owner-side bitmap, then the foreign-free bitmap (one bit per
/// cell each), then the payload.
const OWNED_BITMAP_OFFSET: usize = HEADER_SIZE;
const FOREIGN_BITMAP_OFFSET: usize = HEADER_SIZE + CELLS as usize / 8;
const PAYLOAD_OFFSET: usize = HEADER_SIZE + CELLS as usize / 4;

/// Highest admissible value of the high-water mark: the cells covered by
/// the header and bitmaps are never issued.
const MAX_CELL: u32 = CELLS - (PAYLOAD_OFFSET >> SMALL_CELL_SHIFT) as u32;

const _: () = assert!(std::mem::size_of::<Header<SmallAlloc>>() <= HEADER_SIZE);
const _: () = assert!(PAYLOAD_OFFSET % SMALL_CELL_SIZE == 0);

/// A small block outfitted as a slab of 16-byte cells for requests up to
/// [`crate::MAX_SMALL_ALLOC`] bytes. Allocation is a monotone bump of
/// `cur_bit` with no search and no atomics; reclamation happens on the
/// slow path (`try_hard_alloc`) by folding the foreign-free
/// bitmap into the owned one and walking the mark back down.
///
/// A slab is only returned to its parent block when the owned bitmap is
/// empty, and an empty owned bitmap implies an empty foreign bitmap (an
/// undrained foreign free keeps the owner bit set). A recycled slot
/// therefore always starts with all-zero bitmaps, which is why
/// construction doesn't clear them.
pub(crate) struct SmallAlloc {
    /// Large block whose slot this slab occupies.
    parent: NonNull<Header<LargeBlock>>,
    /// The thread front end that minted this slab. Written once during
    /// construction; foreign threads read it to route their frees.
    owner: *mut ThreadAlloc,
    /// High-water mark, in cells from the payload start. Every set bit in
    /// the owned bitmap is below it.
    cur_bit: u32,
}

impl SmallAlloc {
    pub fn new(parent: NonNull<Header<LargeBlock>>, owner: *mut ThreadAlloc) -> Self {
        Self {
            parent,
            owner,
            cur_bit: 0,
        }
    }
}

impl Header<SmallAlloc> {
    #[inline]
    unsafe fn base(sa: NonNull<Self>) -> *mut u8 {
        sa.as_ptr().cast()
    }

    #[inline]
    unsafe fn owned_bits(sa: NonNull<Self>) -> Bitmap {
        Bitmap::at(Self::base(sa).add(OWNED_BITMAP_OFFSET))
    }

    #[inline]
    unsafe fn foreign_bits(sa: NonNull<Self>) -> Bitmap {
        Bitmap::at(Self::base(sa).add(FOREIGN_BITMAP_OFFSET))
    }

    #[inline]
    unsafe fn payload(sa: NonNull<Self>) -> *mut u8 {
        Self::base(sa).add(PAYLOAD_OFFSET)
    }

    #[inline]
    unsafe fn cell_index(sa: NonNull<Self>, address: NonNull<u8>) -> u32 {
        ((address.as_ptr().addr() - Self::payload(sa).addr()) >> SMALL_CELL_SHIFT) as u32
    }

    /// The minting thread. Read-only after construction; this is the one
    /// header field foreign threads look at, so it is read through the raw
    /// pointer, never through a reference.
    #[inline]
    pub unsafe fn owner(sa: NonNull<Self>) -> *mut ThreadAlloc {
        ptr::addr_of!((*sa.as_ptr()).data.owner).read()
    }

    #[inline]
    pub unsafe fn parent(sa: NonNull<Self>) -> NonNull<Header<LargeBlock>> {
        (*sa.as_ptr()).data.parent
    }

    /// Fast path: claims `cells` cells at the high-water mark, or returns
    /// null if they don't fit. Home thread only.
    pub unsafe fn alloc(sa: NonNull<Self>, cells: u32) -> *mut u8 {
        let cur = (*sa.as_ptr()).data.cur_bit;
        if cur + cells > MAX_CELL {
            return ptr::null_mut();
        }

        Self::owned_bits(sa).set(cur);
        (*sa.as_ptr()).data.cur_bit = cur + cells;
        Self::payload(sa).add((cur as usize) << SMALL_CELL_SHIFT)
    }

    /// Slow path: drains pending foreign frees into the owned bitmap,
    /// walking the high-water mark back over any reclaimed tail, then
    /// retries the fast path once. Returns null if the slab still can't
    /// fit `cells`. Home thread only.
    pub unsafe fn try_hard_alloc(sa: NonNull<Self>, cells: u32) -> *mut u8 {
        let owned = Self::owned_bits(sa);
        let foreign = Self::foreign_bits(sa);

        let top = ((*sa.as_ptr()).data.cur_bit >> WORD_SHIFT) as usize;
        for word in (0..=top).rev() {
            let drained = foreign.load_word(word);
            if drained == 0 {
                continue;
            }
            foreign.fetch_clear_word(word, drained);
            owned.clear_word(word, drained);

            let low = drained.trailing_zeros() + ((word as u32) << WORD_SHIFT);
            let live = owned.rfind((*sa.as_ptr()).data.cur_bit);
            if live >= low as i32 {
                // A live cell still sits above everything we just drained;
                // the mark cannot move.
                break;
            }
            let cur = if live >= 0 { low } else { 0 };
            (*sa.as_ptr()).data.cur_bit = cur;
            if cur == 0 {
                break;
            }
        }

        Self::alloc(sa, cells)
    }

    /// Home-thread free. Clears the cell's owner bit and, when the freed
    /// cell was the topmost live one, retreats the high-water mark to it
    /// (the live cell below has unknown extent, so the mark cannot retreat
    /// past the freed cell's own start). Returns true iff the slab became
    /// empty.
    pub unsafe fn free(sa: NonNull<Self>, address: NonNull<u8>) -> bool {
        let i = Self::cell_index(sa, address);
        let owned = Self::owned_bits(sa);

        if cfg!(debug_assertions) {
            assert!(
                owned.test_and_unset(i),
                "free of a cell that was never issued"
            );
        } else {
            owned.unset(i);
        }
        let live = owned.rfind((*sa.as_ptr()).data.cur_bit);
        if live < i as i32 {
            let cur = if live >= 0 { i } else { 0 };
            (*sa.as_ptr()).data.cur_bit = cur;
            cur == 0
        } else {
            false
        }
    }

    /// Foreign-thread free: publishes the cell in the foreign bitmap with
    /// a relaxed OR and touches nothing else. The home thread folds it in
    /// on its next slow path.
    pub unsafe fn xfree(sa: NonNull<Self>, address: NonNull<u8>) {
        Self::foreign_bits(sa).atomic_set(Self::cell_index(sa, address));
    }

    /// Grows the allocation at `address` in place, which is only possible
    /// when it is the topmost live allocation and the new size still fits.
    /// Returns null otherwise; the caller falls back to alloc-copy-free.
    /// Home thread only.
    pub unsafe fn realloc(
        sa: NonNull<Self>,
        address: NonNull<u8>,
        old_cells: u32,
        new_cells: u32,
    ) -> *mut u8 {
        let i = Self::cell_index(sa, address);
        if (*sa.as_ptr()).data.cur_bit == i + old_cells && i + new_cells <= MAX_CELL {
            (*sa.as_ptr()).data.cur_bit = i + new_cells;
            return address.as_ptr();
        }
        ptr::null_mut()
    }
}
