//! shardalloc: a thread-caching pool allocator with sized deallocation.
//!
//! Requests up to [`MAX_POOL_ALLOC`] bytes are served from a three-level
//! hierarchy of virtual-memory pools; anything larger falls through to the
//! host allocator. Each thread keeps a private front end so the
//! steady-state allocation path takes no locks and no atomics; the only
//! shared structure is a process-wide arena of huge blocks, sharded by
//! thread id to keep its mutexes quiet.
//!
//! The public surface is sized, C-shaped and null-on-OOM: [`alloc`],
//! [`zalloc`], [`free`], [`realloc`] and [`static_alloc`]. [`ShardAlloc`]
//! adapts the same machinery to [`std::alloc::GlobalAlloc`]:
//!
//! ```no_run
//! #[global_allocator]
//! static GLOBAL: shardalloc::ShardAlloc = shardalloc::ShardAlloc;
//!
//! fn main() {
//!     let v = vec![1u64, 2, 3];
//!     assert_eq!(v[2], 3);
//! }
//! ```
//!
//! Building with the `system-alloc` feature turns every entry point into a
//! thin forwarder to the host allocator and compiles none of the pool
//! machinery.

#[cfg(not(feature = "system-alloc"))]
use std::ptr::NonNull;

#[cfg(not(feature = "system-alloc"))]
mod align;
mod allocator;
mod host;

#[cfg(not(feature = "system-alloc"))]
mod arena;
#[cfg(not(feature = "system-alloc"))]
mod bitmap;
#[cfg(not(feature = "system-alloc"))]
mod block;
#[cfg(not(feature = "system-alloc"))]
mod bump;
#[cfg(not(feature = "system-alloc"))]
mod header;
#[cfg(not(feature = "system-alloc"))]
mod large;
#[cfg(not(feature = "system-alloc"))]
mod list;
#[cfg(not(feature = "system-alloc"))]
mod platform;
#[cfg(not(feature = "system-alloc"))]
mod small;
#[cfg(not(feature = "system-alloc"))]
mod thread;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
#[cfg(not(feature = "system-alloc"))]
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Word width exponent: bits per occupancy word is `1 << WORD_SHIFT`.
#[cfg(not(feature = "system-alloc"))]
#[cfg(target_pointer_width = "64")]
pub(crate) const WORD_SHIFT: u32 = 6;
#[cfg(not(feature = "system-alloc"))]
#[cfg(target_pointer_width = "32")]
pub(crate) const WORD_SHIFT: u32 = 5;

/// Number of shards in the global arena. Power of two so shard selection is
/// a mask on the thread id.
#[cfg(not(feature = "system-alloc"))]
#[cfg(target_pointer_width = "64")]
pub(crate) const SHARD_COUNT: usize = 32;
#[cfg(not(feature = "system-alloc"))]
#[cfg(target_pointer_width = "32")]
pub(crate) const SHARD_COUNT: usize = 4;

/// Bits per machine word.
#[cfg(not(feature = "system-alloc"))]
pub(crate) const WORD_BITS: u32 = 1 << WORD_SHIFT;

/// Mask for the bit index within a word. Doubles as the reserved slot
/// index: occupancy words keep their top bit clear so that a full word can
/// still be recognized by scanning for a zero bit (see [`crate::block`]).
#[cfg(not(feature = "system-alloc"))]
pub(crate) const WORD_MASK: u32 = WORD_BITS - 1;

/// Small block: the slab a `SmallAlloc` lives in (32 KiB).
#[cfg(not(feature = "system-alloc"))]
pub(crate) const SMALL_BLOCK_BITS: u32 = 15;
/// Large block: `WORD_BITS` small blocks (2 MiB on 64-bit).
#[cfg(not(feature = "system-alloc"))]
pub(crate) const LARGE_BLOCK_BITS: u32 = SMALL_BLOCK_BITS + WORD_SHIFT;
/// Huge block: `WORD_BITS` large blocks (128 MiB on 64-bit).
#[cfg(not(feature = "system-alloc"))]
pub(crate) const HUGE_BLOCK_BITS: u32 = LARGE_BLOCK_BITS + WORD_SHIFT;

#[cfg(not(feature = "system-alloc"))]
pub(crate) const SMALL_BLOCK_SIZE: usize = 1 << SMALL_BLOCK_BITS;
#[cfg(not(feature = "system-alloc"))]
pub(crate) const LARGE_BLOCK_SIZE: usize = 1 << LARGE_BLOCK_BITS;
#[cfg(not(feature = "system-alloc"))]
pub(crate) const HUGE_BLOCK_SIZE: usize = 1 << HUGE_BLOCK_BITS;

/// Largest request served by the small (16-byte cell) class.
pub const MAX_SMALL_ALLOC: usize = 2048;

/// Largest request served from the pools at all. Anything bigger goes to
/// the host allocator.
pub const MAX_POOL_ALLOC: usize = 1 << 17;

pub use allocator::{alloc, free, realloc, static_alloc, zalloc, ShardAlloc};
