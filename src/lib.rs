//! `cuwalloc` — a general-purpose two-tier dynamic memory allocator.
//!
//! Requests flow through two layers: a [`pool_alloc::PoolAllocator`] routes
//! small and mid-sized requests to fixed-size chunk pools (a byte pool, pow2
//! pools, a handful of auxiliary non-pow2 classes, and raw bins for
//! everything larger), drawing the page-aligned slabs it needs from a
//! [`page_alloc::PageAllocator`] — optionally through a [`cache::CachedAlloc`]
//! layer that retains a few recently freed slabs to cut OS round trips.
//!
//! Each layer is safe to use on its own; [`global`] wires the two together
//! behind a mutex as the crate's process-wide entry point:
//!
//! ```no_run
//! let ptr = cuwalloc::global::malloc(128).unwrap();
//! unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, 128) };
//! cuwalloc::global::free(ptr);
//! ```

pub mod cache;
pub mod config;
pub mod descriptor_pool;
pub mod error;
pub mod global;
pub mod page_alloc;
pub mod pool_alloc;
pub mod slab_source;
pub mod sysmem;
pub mod system_alloc;

pub use cache::CachedAlloc;
pub use config::Config;
pub use error::{AllocError, Result};
pub use page_alloc::PageAllocator;
pub use pool_alloc::PoolAllocator;
pub use slab_source::SlabSource;

/// The composed allocator type the crate ships by default: a pool allocator
/// drawing slabs from a cached layer wrapping the page allocator.
///
/// The cache is always architecturally present — [`Config::use_cache`] being
/// `false` simply sets `cache_slots` to zero, making it a pass-through,
/// rather than the crate carrying a second `PoolAllocator<PageAllocator>`
/// code path.
pub type Allocator = PoolAllocator<CachedAlloc<PageAllocator>>;

/// Build the default composed allocator from a [`Config`].
pub fn new_allocator(config: Config) -> Allocator {
    let page = PageAllocator::new(config);
    let cache_slots = if config.use_cache { config.cache_slots } else { 0 };
    let cached = CachedAlloc::new(page, cache_slots, config.min_slot_size, config.max_slot_size);
    PoolAllocator::new(config, cached)
}

/// Merge `other` into `self`, including the underlying page allocator and
/// cache bookkeeping that [`PoolAllocator::adopt`] deliberately leaves to
/// its caller.
pub fn adopt(into: &mut Allocator, other: &mut Allocator) {
    into.slabs_mut().inner_mut().adopt(other.slabs_mut().inner_mut());
    into.adopt(other);
}
