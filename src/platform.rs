use std::ptr::NonNull;

use crate::Pointer;

/// Commit granule. Reservations and slots are page-multiple powers of two,
/// so a fixed 4 KiB granule is all the pool layer ever needs.
pub(crate) const PAGE_SIZE: usize = 4096;

/// Abstraction for platform specific virtual memory handling. The pools
/// work with reservations (address space without backing) and commit and
/// decommit page ranges inside them as blocks come and go; the kernel API
/// that provides those four verbs differs per platform but nothing above
/// this module cares.
trait PlatformVirtualMemory {
    /// Reserves `length` bytes of address space without backing pages.
    unsafe fn reserve(length: usize) -> Pointer<u8>;

    /// Backs `[address, address + length)` with zero-filled pages. Returns
    /// false if the kernel refused, in which case the range is unchanged.
    unsafe fn commit(address: NonNull<u8>, length: usize) -> bool;

    /// Returns the pages in `[address, address + length)` to the kernel
    /// while keeping the reservation. A later [`commit`] of the same range
    /// yields zero-filled pages again.
    ///
    /// [`commit`]: PlatformVirtualMemory::commit
    unsafe fn decommit(address: NonNull<u8>, length: usize);

    /// Frees the whole reservation starting at `address`.
    unsafe fn release(address: NonNull<u8>, length: usize);
}

/// Zero sized type that implements [`PlatformVirtualMemory`] for each OS.
struct Platform;

#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    Platform::reserve(length)
}

#[inline]
pub(crate) unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
    Platform::commit(address, length)
}

#[inline]
pub(crate) unsafe fn decommit(address: NonNull<u8>, length: usize) {
    Platform::decommit(address, length)
}

#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    Platform::release(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // NORESERVE keeps swap out of the picture until pages are
            // actually committed; the reservation is just address space.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);
            if address == libc::MAP_FAILED {
                return None;
            }
            Some(NonNull::new_unchecked(address).cast())
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            // Remapping FIXED over the reservation replaces the NORESERVE
            // pages with accountable, zero-filled ones.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED;

            let p = address.cast().as_ptr();
            libc::mmap(p, length, protection, flags, -1, 0) == p
        }

        unsafe fn decommit(address: NonNull<u8>, length: usize) {
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags =
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED;

            libc::mmap(address.cast().as_ptr(), length, protection, flags, -1, 0);
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            libc::munmap(address.cast().as_ptr(), length);
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{ffi::c_void, ptr::NonNull};

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            let address =
                Memory::VirtualAlloc(None, length, Memory::MEM_RESERVE, Memory::PAGE_READWRITE);

            NonNull::new(address.cast())
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            let p = address.as_ptr() as *const c_void;
            let committed =
                Memory::VirtualAlloc(Some(p), length, Memory::MEM_COMMIT, Memory::PAGE_READWRITE);

            committed == p as *mut c_void
        }

        unsafe fn decommit(address: NonNull<u8>, length: usize) {
            let _ = Memory::VirtualFree(address.as_ptr().cast(), length, Memory::MEM_DECOMMIT);
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // MEM_RELEASE requires a zero length and frees the whole
            // reservation made by VirtualAlloc.
            let _ = Memory::VirtualFree(address.as_ptr().cast(), 0, Memory::MEM_RELEASE);
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI, so low level memory management is mocked with the
    //! global allocator. Reservations are fully backed from the start and
    //! commit/decommit become no-ops; that loses the zero-on-recommit
    //! property, which no pool invariant depends on.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformVirtualMemory, PAGE_SIZE};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, PAGE_SIZE).unwrap()
    }

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn decommit(_address: NonNull<u8>, _length: usize) {}

        unsafe fn release(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
