//! Process-wide allocator singleton and the public free-function API.
//!
//! Mirrors the shape of the source allocator's global entry points
//! (`malloc`/`realloc`/`free` plus `_ext` variants taking an explicit
//! alignment), backed here by a [`Mutex`]-guarded [`Allocator`] built from
//! [`Config::default`] on first use.

use std::ptr::NonNull;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::{new_allocator, Allocator};

static GLOBAL: Lazy<Mutex<Allocator>> = Lazy::new(|| Mutex::new(new_allocator(Config::default())));

/// The process-wide allocator instance, for callers that want to batch
/// several operations under one lock acquisition.
pub fn allocator() -> &'static Mutex<Allocator> {
    &GLOBAL
}

/// Allocate `size` bytes at the default alignment. Returns `None` if the OS
/// refuses every mapping attempt; never returns a null pointer.
pub fn malloc(size: usize) -> Option<NonNull<u8>> {
    GLOBAL.lock().malloc(size)
}

/// Allocate `size` bytes aligned to `alignment` (rounded up internally when
/// `alignment` is 0, which selects [`Config::basic_alignment`]). `flags` is
/// reserved; only `0` is currently defined.
pub fn malloc_ext(size: usize, alignment: usize, flags: u32) -> Option<NonNull<u8>> {
    GLOBAL.lock().malloc_ext(size, alignment, flags)
}

/// Free a pointer previously returned by `malloc`/`malloc_ext`/`realloc`.
///
/// # Safety
/// `ptr` must be live (not already freed) and must have come from this
/// allocator.
pub fn free(ptr: NonNull<u8>) {
    GLOBAL.lock().free(ptr)
}

pub fn free_ext(ptr: NonNull<u8>, size: usize, alignment: usize, flags: u32) {
    GLOBAL.lock().free_ext(ptr, size, alignment, flags)
}

/// Resize an existing allocation, copying the lesser of the old and new
/// sizes. `ptr` may be the zero-size sentinel; `new_size` may be zero.
pub fn realloc(ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
    GLOBAL.lock().realloc(ptr, new_size)
}

pub fn realloc_ext(
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    alignment: usize,
    flags: u32,
) -> Option<NonNull<u8>> {
    GLOBAL.lock().realloc_ext(ptr, old_size, new_size, alignment, flags)
}

/// Fallible counterpart to [`malloc`] for callers that want `Result` rather
/// than a `None` return on OOM.
pub fn try_malloc(size: usize) -> Result<NonNull<u8>> {
    GLOBAL.lock().try_malloc(size)
}

/// Fallible counterpart to [`realloc`].
pub fn try_realloc(ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
    GLOBAL.lock().try_realloc(ptr, new_size)
}

/// Number of allocations the global allocator currently considers live.
/// Debug/introspection only — not part of the allocation contract.
pub fn live_allocation_count() -> usize {
    GLOBAL.lock().live_allocation_count()
}
