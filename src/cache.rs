//! Cached alloc layer (4.4, optional): retains up to `cache_slots` recently
//! freed page-aligned slabs in capped slots between the pool allocator and
//! the page allocator, trading a little slack memory for fewer OS calls.

use std::ptr::NonNull;

use crate::slab_source::SlabSource;

#[derive(Debug, Clone, Copy)]
struct Slot {
    ptr: NonNull<u8>,
    size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMatch {
    /// Return exactly the requested size; any slack stays in the slot or is flushed.
    Exact,
    /// May return a larger region in one shot, exposing the actual size to the caller.
    Any,
}

pub struct CachedAlloc<S> {
    inner: S,
    slots: Vec<Slot>,
    capacity: usize,
    min_slot_size: usize,
    max_slot_size: usize,
}

impl<S: SlabSource> CachedAlloc<S> {
    pub fn new(inner: S, capacity: usize, min_slot_size: usize, max_slot_size: usize) -> Self {
        Self { inner, slots: Vec::with_capacity(capacity), capacity, min_slot_size, max_slot_size }
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Satisfy `size` from a slot when one strictly exceeds it, leaving the
    /// remainder shrunk in place (or flushed, if it would fall below
    /// `min_slot_size`). Falls through to the underlying source otherwise.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let best = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.size > size)
            .min_by_key(|(_, s)| s.size)
            .map(|(i, _)| i);

        if let Some(idx) = best {
            let slot = self.slots[idx];
            let remainder = slot.size - size;
            if remainder >= self.min_slot_size {
                self.slots[idx] =
                    Slot { ptr: unsafe { NonNull::new_unchecked(slot.ptr.as_ptr().add(size)) }, size: remainder };
            } else {
                self.slots.swap_remove(idx);
                if remainder > 0 {
                    let rest = unsafe { NonNull::new_unchecked(slot.ptr.as_ptr().add(size)) };
                    self.inner.release_slab(rest, remainder);
                }
            }
            return Some(slot.ptr);
        }

        self.inner.acquire_slab(size)
    }

    /// `Any` may hand back a whole slot larger than requested, reporting the
    /// actual size so the caller can make use of the slack.
    pub fn allocate_ext(&mut self, size: usize, mode: CacheMatch) -> Option<(NonNull<u8>, usize)> {
        if mode == CacheMatch::Any {
            if let Some(idx) = self.slots.iter().position(|s| s.size >= size) {
                let slot = self.slots.swap_remove(idx);
                return Some((slot.ptr, slot.size));
            }
        }
        self.allocate(size).map(|p| (p, size))
    }

    /// Fold a freed slab back into the cache. Sorts every slot (including
    /// the not-yet-occupied ones, up to `capacity`) by size ascending, then
    /// tops each under-sized slot from the incoming chunk in turn, evicting
    /// whatever it held before; only what's left after every slot has had a
    /// chance is flushed to the underlying source. Mirrors `fill_slots`.
    pub fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let mut occupied: Vec<Option<Slot>> = self.slots.drain(..).map(Some).collect();
        while occupied.len() < self.capacity {
            occupied.push(None);
        }
        occupied.sort_by_key(|s| s.map_or(0, |s| s.size));

        let mut chunk_ptr = ptr;
        let mut chunk_size = size;

        for slot in occupied.iter_mut() {
            if chunk_size == 0 {
                break;
            }
            let take = chunk_size.min(self.max_slot_size);
            if take < self.min_slot_size {
                break;
            }

            if slot.map_or(0, |s| s.size) < take {
                if let Some(old) = slot.take() {
                    self.inner.release_slab(old.ptr, old.size);
                }
                *slot = Some(Slot { ptr: chunk_ptr, size: take });
                chunk_ptr = unsafe { NonNull::new_unchecked(chunk_ptr.as_ptr().add(take)) };
                chunk_size -= take;
            }
        }

        if chunk_size > 0 {
            self.inner.release_slab(chunk_ptr, chunk_size);
        }

        self.slots = occupied.into_iter().flatten().collect();
    }

    pub fn reallocate(&mut self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
        if new_size <= old_size {
            return Some(ptr);
        }
        let new_ptr = self.allocate(new_size)?;
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size) };
        self.deallocate(ptr, old_size);
        Some(new_ptr)
    }

    /// Flush every remaining slot to the underlying allocator. Called on `Drop`.
    pub fn flush_slots(&mut self) {
        for slot in self.slots.drain(..) {
            self.inner.release_slab(slot.ptr, slot.size);
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl<S: SlabSource> SlabSource for CachedAlloc<S> {
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

impl<S: SlabSource> Drop for CachedAlloc<S> {
    fn drop(&mut self) {
        self.flush_slots();
    }
}

// SAFETY: slots hold raw pointers to exclusively-owned slabs, not shared
// mutable aliasing; access is already serialized by the allocator's outer
// mutex.
unsafe impl<S: Send> Send for CachedAlloc<S> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};

    /// A `SlabSource` over the process heap, for exercising `CachedAlloc` in
    /// isolation from the page allocator.
    struct HeapSource;

    impl SlabSource for HeapSource {
        fn acquire_slab(&mut self, size: usize) -> Option<NonNull<u8>> {
            let layout = Layout::from_size_align(size, 1).ok()?;
            NonNull::new(unsafe { alloc(layout) })
        }

        fn release_slab(&mut self, ptr: NonNull<u8>, size: usize) {
            let layout = Layout::from_size_align(size, 1).unwrap();
            unsafe { dealloc(ptr.as_ptr(), layout) };
        }

        fn resize_slab(&mut self, ptr: NonNull<u8>, _old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
            self.acquire_slab(new_size).map(|p| {
                self.release_slab(ptr, new_size);
                p
            })
        }
    }

    #[test]
    fn scenario_five_cache_mix() {
        let mut cache = CachedAlloc::new(HeapSource, 4, 1, 256);
        let mut live = Vec::new();
        for _ in 0..4 {
            let p = cache.inner_mut().acquire_slab(256).unwrap();
            cache.deallocate(p, 256);
        }
        assert_eq!(cache.slot_count(), 4);

        let mut from_underlying = 0;
        let mut size = 1;
        while size <= 256 {
            match cache.allocate(size) {
                Some(p) => live.push((p, size)),
                None => {
                    from_underlying += 1;
                    live.push((cache.inner_mut().acquire_slab(size).unwrap(), size));
                }
            }
            size *= 2;
        }
        assert_eq!(from_underlying, 1, "only the exact max-slot-size request should miss the cache");

        cache.flush_slots();
        assert_eq!(cache.slot_count(), 0);
    }

    /// A source that hands out freshly leaked buffers and just counts bytes
    /// handed back, so chunk-splitting release calls (sub-ranges of a prior
    /// `acquire_slab`) don't have to satisfy a real allocator's pointer/layout
    /// contract.
    struct CountingSource {
        released: usize,
    }

    impl SlabSource for CountingSource {
        fn acquire_slab(&mut self, size: usize) -> Option<NonNull<u8>> {
            let buf = vec![0u8; size].into_boxed_slice();
            NonNull::new(Box::leak(buf).as_mut_ptr())
        }

        fn release_slab(&mut self, _ptr: NonNull<u8>, size: usize) {
            self.released += size;
        }

        fn resize_slab(&mut self, ptr: NonNull<u8>, _old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
            self.acquire_slab(new_size).map(|p| {
                self.release_slab(ptr, new_size);
                p
            })
        }
    }

    #[test]
    fn deallocate_tops_every_under_sized_slot_before_flushing_the_remainder() {
        let mut cache = CachedAlloc::new(CountingSource { released: 0 }, 2, 1, 10);

        let p1 = cache.inner_mut().acquire_slab(5).unwrap();
        cache.deallocate(p1, 5);
        let p2 = cache.inner_mut().acquire_slab(5).unwrap();
        cache.deallocate(p2, 5);
        assert_eq!(cache.slot_count(), 2);
        assert!(cache.slots.iter().all(|s| s.size == 5));

        // A 30-byte chunk against two under-sized (5-byte) slots must top up
        // BOTH of them (not just the first), then flush only what's left.
        let p3 = cache.inner_mut().acquire_slab(30).unwrap();
        cache.deallocate(p3, 30);

        assert_eq!(cache.slot_count(), 2, "both slots stay filled, none left empty");
        assert!(
            cache.slots.iter().all(|s| s.size == 10),
            "both slots should be topped up to max_slot_size, not just one"
        );
        assert_eq!(
            cache.inner.released, 20,
            "5+5 evicted slot contents plus the final 10-byte remainder"
        );
    }
}
