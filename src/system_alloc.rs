//! System allocator adapter (4.5): the thinnest possible [`SlabSource`] —
//! every call goes straight to the OS page primitive, with no coalescing,
//! no descriptor bookkeeping, and a memcpy-based grow on reallocate. Useful
//! as a baseline to compare the page allocator against, and as the simplest
//! concrete `SlabSource` for tests that don't need coalescing.

use std::ptr::NonNull;

use crate::config::Config;
use crate::slab_source::SlabSource;
use crate::sysmem;

pub struct SystemAllocator {
    config: Config,
}

impl SystemAllocator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        sysmem::allocate_sysmem(self.config.page_round_up(size.max(1)))
    }

    pub fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { sysmem::deallocate_sysmem(ptr, self.config.page_round_up(size.max(1))) };
    }

    pub fn reallocate(&mut self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
        let new_ptr = self.allocate(new_size)?;
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size)) };
        self.deallocate(ptr, old_size);
        Some(new_ptr)
    }
}

impl SlabSource for SystemAllocator {
    fn acquire_slab(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.allocate(size)
    }

    fn release_slab(&mut self, ptr: NonNull<u8>, size: usize) {
        self.deallocate(ptr, size)
    }

    fn resize_slab(&mut self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
        self.reallocate(ptr, old_size, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_direct_mapping() {
        let mut sys = SystemAllocator::new(Config::default());
        let p = sys.allocate(4096).unwrap();
        unsafe { std::ptr::write_bytes(p.as_ptr(), 1, 4096) };
        sys.deallocate(p, 4096);
    }
}
