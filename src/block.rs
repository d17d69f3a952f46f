use std::ptr::NonNull;

use crate::{
    align::align_up,
    header::Header,
    list::Node,
    platform,
    small::SmallAlloc,
    thread::ThreadAlloc,
    Pointer, HUGE_BLOCK_SIZE, LARGE_BLOCK_BITS, LARGE_BLOCK_SIZE, SMALL_BLOCK_BITS, WORD_MASK,
};

/// Both block levels track occupancy with a single machine word, bit i
/// mapping to slot i. The top bit ([`WORD_MASK`]) is never used for a slot:
/// with it permanently clear, `(!bits).trailing_zeros()` distinguishes
/// "has room" (< [`WORD_MASK`]) from "full" (== [`WORD_MASK`]) without a
/// separate counter.
#[inline]
fn first_free_slot(bits: usize) -> Option<u32> {
    let i = (!bits).trailing_zeros();
    (i < WORD_MASK).then_some(i)
}

/// A huge block is one `2^27`-byte reservation: this header in its first
/// (and initially only committed) page, and [`WORD_MASK`] large-block slots
/// starting at `base`. Owned by one arena shard; every field is guarded by
/// that shard's mutex.
pub(crate) struct HugeBlock {
    /// First slot address. `LARGE_BLOCK_SIZE`-aligned and strictly above
    /// this header, so the header page never overlaps slot 0.
    base: NonNull<u8>,
    /// Occupancy word.
    bits: usize,
}

impl Header<HugeBlock> {
    /// Reserves a fresh huge region and writes this header into its first
    /// page. Returns None if the kernel refused the reservation or the
    /// header-page commit; a half-made region is released, never leaked.
    pub unsafe fn map() -> Pointer<Self> {
        let region = platform::reserve(HUGE_BLOCK_SIZE)?;
        if !platform::commit(region, platform::PAGE_SIZE) {
            platform::release(region, HUGE_BLOCK_SIZE);
            return None;
        }

        let mut base = region
            .as_ptr()
            .map_addr(|addr| align_up(addr, LARGE_BLOCK_SIZE));
        if base == region.as_ptr() {
            base = base.add(LARGE_BLOCK_SIZE);
        }

        Some(Node::write(
            region,
            HugeBlock {
                base: NonNull::new_unchecked(base),
                bits: 0,
            },
        ))
    }

    /// Returns the whole reservation. The block must be unlinked and empty.
    pub unsafe fn unmap(hb: NonNull<Self>) {
        platform::release(hb.cast(), HUGE_BLOCK_SIZE);
    }

    /// Hands out the lowest free large slot, or None when all slots are
    /// taken. The slot's pages are not committed yet.
    pub unsafe fn alloc_slot(hb: NonNull<Self>) -> Pointer<u8> {
        let i = first_free_slot((*hb.as_ptr()).data.bits)?;
        (*hb.as_ptr()).data.bits |= 1 << i;

        let base = (*hb.as_ptr()).data.base;
        Some(NonNull::new_unchecked(
            base.as_ptr().add((i as usize) << LARGE_BLOCK_BITS),
        ))
    }

    /// Clears the slot holding `address` and reports whether the block is
    /// now empty.
    pub unsafe fn free_slot(hb: NonNull<Self>, address: NonNull<u8>) -> bool {
        let base = (*hb.as_ptr()).data.base;
        let i = (address.as_ptr().addr() - base.as_ptr().addr()) >> LARGE_BLOCK_BITS;

        (*hb.as_ptr()).data.bits &= !(1 << i);
        (*hb.as_ptr()).data.bits == 0
    }

    #[cfg(test)]
    pub fn occupancy(hb: NonNull<Self>) -> usize {
        unsafe { (*hb.as_ptr()).data.bits }
    }
}

/// A large block is one committed large slot re-partitioned into
/// [`WORD_MASK`] small-block slots. The header occupies the whole first
/// small block (the bookkeeping needs only a fraction of it, but slots are
/// the granularity the occupancy word speaks). Owned by one thread front
/// end; no locking.
pub(crate) struct LargeBlock {
    /// The huge block this large slot came from. Only ever used to return
    /// the slot once every small block in it has been freed.
    parent: NonNull<Header<HugeBlock>>,
    /// First small-block slot, right after the header's block.
    base: NonNull<u8>,
    /// Occupancy word.
    bits: usize,
}

impl LargeBlock {
    /// Header data for a large block living at `slot`.
    pub unsafe fn new(slot: NonNull<u8>, parent: NonNull<Header<HugeBlock>>) -> Self {
        Self {
            parent,
            base: NonNull::new_unchecked(slot.as_ptr().add(1 << SMALL_BLOCK_BITS)),
            bits: 0,
        }
    }
}

impl Header<LargeBlock> {
    pub unsafe fn parent(lb: NonNull<Self>) -> NonNull<Header<HugeBlock>> {
        (*lb.as_ptr()).data.parent
    }

    /// Hands out the lowest free small-block slot, or None when full.
    pub unsafe fn alloc_slot(lb: NonNull<Self>) -> Pointer<u8> {
        let i = first_free_slot((*lb.as_ptr()).data.bits)?;
        (*lb.as_ptr()).data.bits |= 1 << i;

        let base = (*lb.as_ptr()).data.base;
        Some(NonNull::new_unchecked(
            base.as_ptr().add((i as usize) << SMALL_BLOCK_BITS),
        ))
    }

    /// Clears the slot holding `address` and reports whether the block is
    /// now empty.
    pub unsafe fn free_slot(lb: NonNull<Self>, address: NonNull<u8>) -> bool {
        let base = (*lb.as_ptr()).data.base;
        let i = (address.as_ptr().addr() - base.as_ptr().addr()) >> SMALL_BLOCK_BITS;

        (*lb.as_ptr()).data.bits &= !(1 << i);
        (*lb.as_ptr()).data.bits == 0
    }

    /// Outfits a free small-block slot as a slab for `owner`. Returns None
    /// when every slot is taken.
    pub unsafe fn make_small_alloc(
        lb: NonNull<Self>,
        owner: *mut ThreadAlloc,
    ) -> Pointer<Header<SmallAlloc>> {
        let slot = Self::alloc_slot(lb)?;
        Some(Node::write(slot, SmallAlloc::new(lb, owner)))
    }
}
