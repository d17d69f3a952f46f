//! The host allocator: where oversize requests, static-allocator chunks and
//! per-thread front-end storage come from. Kept separate from the pools so
//! registering [`crate::ShardAlloc`] as the global allocator cannot recurse
//! into itself.

/// Alignment the host guarantees for every size we forward (glibc and the
/// Windows process heap both align to 16 on 64-bit targets).
#[cfg_attr(feature = "system-alloc", allow(dead_code))]
pub(crate) const HOST_ALIGN: usize = 16;

#[cfg(unix)]
#[cfg(not(miri))]
mod imp {
    pub(crate) unsafe fn malloc(size: usize) -> *mut u8 {
        libc::malloc(size).cast()
    }

    pub(crate) unsafe fn free(address: *mut u8, _size: usize) {
        libc::free(address.cast());
    }

    pub(crate) unsafe fn realloc(address: *mut u8, _old: usize, new: usize) -> *mut u8 {
        libc::realloc(address.cast(), new).cast()
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod imp {
    use std::ffi::c_void;

    use windows::Win32::System::Memory;

    pub(crate) unsafe fn malloc(size: usize) -> *mut u8 {
        let Ok(heap) = Memory::GetProcessHeap() else {
            return std::ptr::null_mut();
        };
        Memory::HeapAlloc(heap, Memory::HEAP_FLAGS(0), size).cast()
    }

    pub(crate) unsafe fn free(address: *mut u8, _size: usize) {
        if let Ok(heap) = Memory::GetProcessHeap() {
            let _ = Memory::HeapFree(heap, Memory::HEAP_FLAGS(0), Some(address as *const c_void));
        }
    }

    pub(crate) unsafe fn realloc(address: *mut u8, _old: usize, new: usize) -> *mut u8 {
        let Ok(heap) = Memory::GetProcessHeap() else {
            return std::ptr::null_mut();
        };
        Memory::HeapReAlloc(
            heap,
            Memory::HEAP_FLAGS(0),
            Some(address as *const c_void),
            new,
        )
        .cast()
    }
}

#[cfg(miri)]
mod imp {
    //! Under Miri the host is the Rust global allocator; sized frees make
    //! the layouts exact, so this mock doubles as a leak detector for the
    //! oversize path.

    use std::alloc;

    use super::HOST_ALIGN;

    fn to_layout(size: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(size.max(1), HOST_ALIGN).unwrap()
    }

    pub(crate) unsafe fn malloc(size: usize) -> *mut u8 {
        alloc::alloc(to_layout(size))
    }

    pub(crate) unsafe fn free(address: *mut u8, size: usize) {
        alloc::dealloc(address, to_layout(size));
    }

    pub(crate) unsafe fn realloc(address: *mut u8, old: usize, new: usize) -> *mut u8 {
        alloc::realloc(address, to_layout(old), new)
    }
}

pub(crate) use imp::{free, malloc, realloc};
