//! OS page primitive.
//!
//! Out of scope per the component design (treated as an interface), but
//! implemented here as a thin wrapper since the rest of the crate cannot
//! link without it. Unix goes through `libc::mmap`/`munmap`; Windows goes
//! through `VirtualAlloc`/`VirtualFree`.

use std::ptr::NonNull;

#[derive(Debug, Clone, Copy)]
pub struct SysmemInfo {
    pub page_size: usize,
}

/// Query the OS for page size. Returns the static default unless the caller
/// opts into runtime resolution (see `Config::use_resolved_page_size`).
pub fn get_sysmem_info(resolved: bool, default_page_size: usize) -> SysmemInfo {
    if !resolved {
        return SysmemInfo { page_size: default_page_size };
    }

    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size > 0 {
            return SysmemInfo { page_size: page_size as usize };
        }
    }

    SysmemInfo { page_size: default_page_size }
}

/// Reserve a page-aligned anonymous mapping of exactly `size` bytes.
/// Returns `None` on failure; never partially maps.
pub fn allocate_sysmem(size: usize) -> Option<NonNull<u8>> {
    #[cfg(unix)]
    {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            tracing::debug!(size, "mmap failed");
            return None;
        }
        return NonNull::new(ptr as *mut u8);
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if ptr.is_null() {
            tracing::debug!(size, "VirtualAlloc failed");
            return None;
        }
        return NonNull::new(ptr as *mut u8);
    }

    #[allow(unreachable_code)]
    {
        None
    }
}

/// Release a mapping previously returned by `allocate_sysmem`. `size` must
/// match the original request (full-range release only; partial release of
/// a `mmap`'d range is not supported by this primitive).
///
/// # Safety
/// `ptr` must have been returned by a prior `allocate_sysmem(size)` call and
/// not already released.
pub unsafe fn deallocate_sysmem(ptr: NonNull<u8>, size: usize) {
    #[cfg(unix)]
    {
        let rc = libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
        if rc != 0 {
            tracing::warn!(size, "munmap failed");
        }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
        let _ = size;
        let ok = VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE);
        if ok == 0 {
            tracing::warn!("VirtualFree failed");
        }
    }
}
