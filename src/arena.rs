use std::{
    ptr::NonNull,
    sync::{Mutex, PoisonError},
};

use crate::{
    block::{HugeBlock, LargeBlock},
    header::Header,
    large::LargeAlloc,
    list::{LinkedList, Node},
    platform,
    thread::ThreadAlloc,
    Pointer, LARGE_BLOCK_SIZE, SHARD_COUNT,
};

/// How many huge blocks past the head a shard probes for a free slot
/// before giving up and mapping a fresh one.
const SCAN_LIMIT: usize = 8;

/// The huge blocks of one shard. The list only stores pointers into mapped
/// regions and is mutated exclusively under the shard mutex, which is what
/// makes handing it between threads sound.
struct HugeList {
    blocks: LinkedList<HugeBlock>,
}

unsafe impl Send for HugeList {}

struct Shard {
    huge: Mutex<HugeList>,
}

impl Shard {
    const fn new() -> Self {
        Self {
            huge: Mutex::new(HugeList {
                blocks: LinkedList::new(),
            }),
        }
    }
}

/// Process-wide arena of huge blocks, partitioned into [`SHARD_COUNT`]
/// independently locked shards so that front ends on different threads
/// rarely contend. A thread always deals with the shard picked by its id;
/// per-thread front ends hit this path only to mint or retire whole large
/// blocks, so the mutexes see little traffic.
pub(crate) struct Arena {
    shards: [Shard; SHARD_COUNT],
}

pub(crate) static ARENA: Arena = Arena::new();

impl Arena {
    pub const fn new() -> Self {
        Self {
            shards: [const { Shard::new() }; SHARD_COUNT],
        }
    }

    #[inline]
    fn shard(&self, id: u32) -> &Mutex<HugeList> {
        &self.shards[id as usize & (SHARD_COUNT - 1)].huge
    }

    /// Takes a free large slot from the shard, committing its pages before
    /// returning. Returns the slot and the huge block it came from, or
    /// None if the system is out of memory.
    pub unsafe fn alloc_large_slot(
        &self,
        id: u32,
    ) -> Option<(NonNull<u8>, NonNull<Header<HugeBlock>>)> {
        let (slot, hb) = {
            let mut list = self.shard(id).lock().unwrap_or_else(PoisonError::into_inner);
            take_slot(&mut list.blocks)?
        };

        if platform::commit(slot, LARGE_BLOCK_SIZE) {
            return Some((slot, hb));
        }

        // The kernel refused the backing pages: give the bit back and
        // propagate OOM. The block stays linked; later traffic reuses or
        // releases it.
        let _guard = self.shard(id).lock().unwrap_or_else(PoisonError::into_inner);
        Header::<HugeBlock>::free_slot(hb, slot);
        None
    }

    /// Returns a large slot to its huge block. Decommits outside the lock,
    /// updates occupancy under it, and releases the whole block once it is
    /// empty and not the shard's head (the head stays warm even when
    /// empty, so a thread bouncing around empty doesn't thrash the
    /// kernel).
    pub unsafe fn free_large_slot(
        &self,
        slot: NonNull<u8>,
        hb: NonNull<Header<HugeBlock>>,
        id: u32,
    ) {
        platform::decommit(slot, LARGE_BLOCK_SIZE);

        let release = {
            let mut list = self.shard(id).lock().unwrap_or_else(PoisonError::into_inner);
            let empty = Header::<HugeBlock>::free_slot(hb, slot);
            if empty && list.blocks.first() != Some(hb) {
                list.blocks.remove(hb);
                true
            } else {
                false
            }
        };

        if release {
            Header::<HugeBlock>::unmap(hb);
        }
    }

    /// Mints a large block: a committed large slot with a [`LargeBlock`]
    /// header constructed in place. The caller links it into its own list.
    pub unsafe fn make_large_block(&self, id: u32) -> Pointer<Header<LargeBlock>> {
        let (slot, hb) = self.alloc_large_slot(id)?;
        Some(Node::write(slot, LargeBlock::new(slot, hb)))
    }

    /// Mints a large slab: a committed large slot with a [`LargeAlloc`]
    /// header constructed in place for `owner`.
    pub unsafe fn make_large_alloc(
        &self,
        id: u32,
        owner: *mut ThreadAlloc,
    ) -> Pointer<Header<LargeAlloc>> {
        let (slot, hb) = self.alloc_large_slot(id)?;
        Some(Node::write(slot, LargeAlloc::new(hb, owner)))
    }

    #[cfg(test)]
    fn huge_block_count(&self, id: u32) -> usize {
        self.shard(id)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks
            .len
    }
}

/// Slot search under the shard lock: the head block first, then up to
/// [`SCAN_LIMIT`] of its successors (a supplier is promoted to head), and
/// finally a freshly mapped block at the front.
unsafe fn take_slot(
    blocks: &mut LinkedList<HugeBlock>,
) -> Option<(NonNull<u8>, NonNull<Header<HugeBlock>>)> {
    if let Some(head) = blocks.first() {
        if let Some(slot) = Header::<HugeBlock>::alloc_slot(head) {
            return Some((slot, head));
        }

        let mut next = head.as_ref().next;
        let mut probed = 0;
        while let Some(hb) = next {
            if probed == SCAN_LIMIT {
                break;
            }
            if let Some(slot) = Header::<HugeBlock>::alloc_slot(hb) {
                blocks.move_to_front(hb);
                return Some((slot, hb));
            }
            next = hb.as_ref().next;
            probed += 1;
        }
    }

    let hb = Header::<HugeBlock>::map()?;
    blocks.push_front(hb);
    // A fresh block always has a free slot.
    Header::<HugeBlock>::alloc_slot(hb).map(|slot| (slot, hb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WORD_MASK;

    // Real reservations; too big for the Miri mock.

    #[test]
    #[cfg_attr(miri, ignore)]
    fn slot_round_trip_keeps_the_head_warm() {
        let arena = Arena::new();
        let id = 7;

        unsafe {
            let (slot, hb) = arena.alloc_large_slot(id).expect("oom");
            assert_eq!(slot.as_ptr().addr() % LARGE_BLOCK_SIZE, 0);

            // Committed and usable.
            slot.as_ptr().write_bytes(0x5A, LARGE_BLOCK_SIZE);
            assert_eq!(*slot.as_ptr(), 0x5A);

            arena.free_large_slot(slot, hb, id);
            // The emptied block is the shard head: retained, not released.
            assert_eq!(arena.huge_block_count(id), 1);

            // And it supplies the next request again.
            let (again, same) = arena.alloc_large_slot(id).expect("oom");
            assert_eq!(again, slot);
            assert_eq!(same, hb);
            arena.free_large_slot(again, same, id);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn non_head_blocks_are_released_when_empty() {
        let arena = Arena::new();
        let id = 9;

        unsafe {
            // Fill the first huge block completely.
            let mut slots = Vec::new();
            for _ in 0..WORD_MASK {
                slots.push(arena.alloc_large_slot(id).expect("oom"));
            }
            assert_eq!(arena.huge_block_count(id), 1);
            let first_hb = slots[0].1;

            // One more forces a second huge block to the front.
            let (extra_slot, extra_hb) = arena.alloc_large_slot(id).expect("oom");
            assert_ne!(extra_hb, first_hb);
            assert_eq!(arena.huge_block_count(id), 2);

            // Draining the old (now non-head) block releases it.
            for (slot, hb) in slots {
                arena.free_large_slot(slot, hb, id);
            }
            assert_eq!(arena.huge_block_count(id), 1);

            arena.free_large_slot(extra_slot, extra_hb, id);
            assert_eq!(arena.huge_block_count(id), 1);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn shards_are_independent() {
        let arena = Arena::new();

        unsafe {
            let (a_slot, a_hb) = arena.alloc_large_slot(0).expect("oom");
            let (b_slot, b_hb) = arena.alloc_large_slot(1).expect("oom");
            assert_ne!(a_hb, b_hb);
            assert_eq!(arena.huge_block_count(0), 1);
            assert_eq!(arena.huge_block_count(1), 1);

            // Same shard index again after wrapping around the shard mask.
            let wrapped = SHARD_COUNT as u32;
            let (c_slot, c_hb) = arena.alloc_large_slot(wrapped).expect("oom");
            assert_eq!(c_hb, a_hb);

            arena.free_large_slot(a_slot, a_hb, 0);
            arena.free_large_slot(b_slot, b_hb, 1);
            arena.free_large_slot(c_slot, c_hb, wrapped);
        }
    }
}
