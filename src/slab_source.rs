//! The narrow interface the pool allocator needs from whatever supplies it
//! page-aligned slabs — either the page allocator directly, or the cached
//! layer (4.4) wrapping it.

use std::ptr::NonNull;

pub trait SlabSource {
    fn acquire_slab(&mut self, size: usize) -> Option<NonNull<u8>>;
    fn release_slab(&mut self, ptr: NonNull<u8>, size: usize);
    fn resize_slab(&mut self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> Option<NonNull<u8>>;
}
