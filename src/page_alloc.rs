//! Page allocator (4.2): serves and reclaims page-aligned contiguous byte
//! ranges, coalescing adjacent freed ranges and requesting fresh slabs from
//! the OS page primitive as needed.
//!
//! The address and size indices named in the component design as red-black
//! trees are `BTreeMap`s here — the safe alternative the design notes
//! explicitly sanction (see SPEC_FULL.md §9), keeping invariants 3 and 5.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::config::Config;
use crate::descriptor_pool::DescriptorPool;
use crate::error::invariant_violation;
use crate::sysmem;

#[repr(C)]
struct FreeBlockDescr {
    offset: u32,
    addr: usize,
    size: usize,
}

#[repr(C)]
struct SysmemDescr {
    offset: u32,
    addr: usize,
    size: usize,
    allocated: usize,
}

pub struct PageAllocator {
    config: Config,
    page_size: usize,
    fbd_pool: DescriptorPool<FreeBlockDescr>,
    sysmem_pool: DescriptorPool<SysmemDescr>,
    free_by_addr: BTreeMap<usize, NonNull<FreeBlockDescr>>,
    free_by_size: BTreeMap<usize, Vec<NonNull<FreeBlockDescr>>>,
    sysmem_by_addr: BTreeMap<usize, NonNull<SysmemDescr>>,
}

impl PageAllocator {
    pub fn new(config: Config) -> Self {
        let info = sysmem::get_sysmem_info(config.use_resolved_page_size, config.page_size);
        Self {
            page_size: info.page_size,
            config,
            fbd_pool: DescriptorPool::new(),
            sysmem_pool: DescriptorPool::new(),
            free_by_addr: BTreeMap::new(),
            free_by_size: BTreeMap::new(),
            sysmem_by_addr: BTreeMap::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_round_up(&self, n: usize) -> usize {
        let p = self.page_size;
        (n + p - 1) & !(p - 1)
    }

    /// Request a page-aligned allocation of at least `size` bytes (rounded
    /// up to a page multiple internally).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = self.page_round_up(size);
        if let Some((&key, blocks)) = self.free_by_size.range(size..).next() {
            let block = blocks[0];
            let _ = key;
            let addr = self.bite(block, size);
            return NonNull::new(addr as *mut u8);
        }
        self.extend(size)
    }

    fn extend(&mut self, size: usize) -> Option<NonNull<u8>> {
        let request = size.max(self.config.min_block_size);
        let (mapped, mapped_size) = match sysmem::allocate_sysmem(request) {
            Some(p) => (p, request),
            None => (sysmem::allocate_sysmem(size)?, size),
        };
        let addr = mapped.as_ptr() as usize;
        let (descr, offset) = self.alloc_smd();
        unsafe {
            *descr.as_ptr() = SysmemDescr { offset, addr, size: mapped_size, allocated: size };
        }
        self.sysmem_by_addr.insert(addr, descr);
        tracing::debug!(addr = format!("{addr:#x}"), mapped_size, "page allocator extended from OS");

        if mapped_size > size {
            self.insert_free_block(addr + size, mapped_size - size);
        }
        NonNull::new(addr as *mut u8)
    }

    pub fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let size = self.page_round_up(size);
        let addr = ptr.as_ptr() as usize;
        let touched = self.overlapping_sysmem(addr, addr + size);
        self.adjust_sysmem_allocated(addr, addr + size, false);
        self.insert_free_block(addr, size);
        self.release_empty_sysmem_ranges(touched);
    }

    pub fn reallocate(&mut self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
        let old_size = self.page_round_up(old_size);
        let new_size = self.page_round_up(new_size);
        if old_size == new_size {
            return Some(ptr);
        }
        let addr = ptr.as_ptr() as usize;

        if new_size < old_size {
            let tail_start = addr + new_size;
            let tail_len = old_size - new_size;
            let touched = self.overlapping_sysmem(tail_start, tail_start + tail_len);
            self.adjust_sysmem_allocated(tail_start, tail_start + tail_len, false);
            self.insert_free_block(tail_start, tail_len);
            self.release_empty_sysmem_ranges(touched);
            return Some(ptr);
        }

        let grow = new_size - old_size;
        if let Some(&right) = self.free_by_addr.get(&(addr + old_size)) {
            let r_size = unsafe { right.as_ref().size };
            if r_size >= grow {
                self.bite(right, grow);
                return Some(ptr);
            }
        }

        let new_ptr = self.allocate(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        }
        self.deallocate(ptr, old_size);
        Some(new_ptr)
    }

    /// Merge `other`'s state into `self`; `other` is left empty.
    pub fn adopt(&mut self, other: &mut PageAllocator) {
        let a = self.total_free_bytes() as u64;
        let b = other.total_free_bytes() as u64;
        let flatten = if a == b {
            false
        } else {
            let d = a.abs_diff(b);
            (a + b) / d > self.config.merge_coef
        };
        if flatten {
            self.flatten_merge(other);
        } else {
            self.insertion_merge(other);
        }
    }

    fn insertion_merge(&mut self, other: &mut PageAllocator) {
        let blocks: Vec<(usize, usize, NonNull<FreeBlockDescr>, u32)> = other
            .free_by_addr
            .iter()
            .map(|(&addr, &d)| {
                let r = unsafe { d.as_ref() };
                (addr, r.size, d, r.offset)
            })
            .collect();

        for (addr, size, d, offset) in blocks {
            other.free_by_addr.remove(&addr);
            other.remove_from_size_index(d, size);
            unsafe {
                if let Some((base, _)) = other.fbd_pool.release(d, offset) {
                    other.fbd_pool.finish_release(base);
                    sysmem::deallocate_sysmem(base, other.config.block_pool_size);
                }
            }
            self.insert_free_block(addr, size);
        }

        let ranges: Vec<(usize, usize, usize)> = other
            .sysmem_by_addr
            .iter()
            .map(|(&addr, &d)| {
                let r = unsafe { d.as_ref() };
                (addr, r.size, r.allocated)
            })
            .collect();
        for (addr, size, allocated) in ranges {
            let (descr, offset) = self.alloc_smd();
            unsafe { *descr.as_ptr() = SysmemDescr { offset, addr, size, allocated } };
            self.sysmem_by_addr.insert(addr, descr);
        }
        other.sysmem_by_addr.clear();
    }

    /// `BTreeMap` indices make a from-scratch rebuild no cheaper than
    /// one-at-a-time insertion, so flatten-merge and insertion-merge share
    /// the same code path here; the distinction in the original exists to
    /// amortize intrusive-tree rebalancing cost this crate doesn't have.
    fn flatten_merge(&mut self, other: &mut PageAllocator) {
        self.insertion_merge(other);
    }

    /// Release every sysmem range currently at `allocated == 0` back to the
    /// OS. Used to reclaim substrate after an `adopt` that drained all live
    /// allocations.
    pub fn release_mem(&mut self) {
        let candidates: Vec<NonNull<SysmemDescr>> = self.sysmem_by_addr.values().copied().collect();
        self.release_empty_sysmem_ranges(candidates);
    }

    // -- bite ----------------------------------------------------------

    fn bite(&mut self, block: NonNull<FreeBlockDescr>, n: usize) -> usize {
        let (addr, size, offset) = unsafe {
            let b = block.as_ref();
            (b.addr, b.size, b.offset)
        };
        self.adjust_sysmem_allocated(addr, addr + n, true);
        self.remove_from_size_index(block, size);

        if size == n {
            self.free_by_addr.remove(&addr);
            unsafe {
                if let Some((base, _)) = self.fbd_pool.release(block, offset) {
                    self.fbd_pool.finish_release(base);
                    sysmem::deallocate_sysmem(base, self.config.block_pool_size);
                }
            }
        } else {
            unsafe {
                (*block.as_ptr()).addr = addr + n;
                (*block.as_ptr()).size = size - n;
            }
            self.free_by_addr.remove(&addr);
            self.free_by_addr.insert(addr + n, block);
            self.insert_size_index(block, size - n);
        }
        addr
    }

    // -- free-block insertion / coalescing ------------------------------

    fn insert_free_block(&mut self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        let left = self.free_by_addr.range(..addr).next_back().map(|(&a, &d)| (a, d));
        let right = self.free_by_addr.range(addr..).next().map(|(&a, &d)| (a, d));

        let merge_left = match left {
            Some((l_addr, l_d)) => {
                let l_size = unsafe { l_d.as_ref().size };
                if l_addr + l_size > addr {
                    invariant_violation("free-block insertion overlaps left neighbor");
                }
                l_addr + l_size == addr
            }
            None => false,
        };
        let merge_right = match right {
            Some((r_addr, _)) => {
                if addr + size > r_addr {
                    invariant_violation("free-block insertion overlaps right neighbor");
                }
                addr + size == r_addr
            }
            None => false,
        };

        match (merge_left, merge_right) {
            (true, true) => {
                let (_, l_d) = left.unwrap();
                let (r_addr, r_d) = right.unwrap();
                let l_size = unsafe { l_d.as_ref().size };
                let r_size = unsafe { r_d.as_ref().size };
                let r_offset = unsafe { r_d.as_ref().offset };
                self.remove_from_size_index(l_d, l_size);
                self.remove_from_size_index(r_d, r_size);
                self.free_by_addr.remove(&r_addr);
                let new_size = l_size + size + r_size;
                unsafe {
                    (*l_d.as_ptr()).size = new_size;
                    if let Some((base, _)) = self.fbd_pool.release(r_d, r_offset) {
                        self.fbd_pool.finish_release(base);
                        sysmem::deallocate_sysmem(base, self.config.block_pool_size);
                    }
                }
                self.insert_size_index(l_d, new_size);
            }
            (true, false) => {
                let (_, l_d) = left.unwrap();
                let l_size = unsafe { l_d.as_ref().size };
                self.remove_from_size_index(l_d, l_size);
                unsafe { (*l_d.as_ptr()).size = l_size + size };
                self.insert_size_index(l_d, l_size + size);
            }
            (false, true) => {
                let (r_addr, r_d) = right.unwrap();
                let r_size = unsafe { r_d.as_ref().size };
                self.remove_from_size_index(r_d, r_size);
                self.free_by_addr.remove(&r_addr);
                unsafe {
                    (*r_d.as_ptr()).addr = addr;
                    (*r_d.as_ptr()).size = r_size + size;
                }
                self.free_by_addr.insert(addr, r_d);
                self.insert_size_index(r_d, r_size + size);
            }
            (false, false) => {
                let (d, offset) = self.alloc_fbd();
                unsafe { *d.as_ptr() = FreeBlockDescr { offset, addr, size } };
                self.free_by_addr.insert(addr, d);
                self.insert_size_index(d, size);
            }
        }
    }

    fn insert_size_index(&mut self, d: NonNull<FreeBlockDescr>, size: usize) {
        self.free_by_size.entry(size).or_default().push(d);
    }

    fn remove_from_size_index(&mut self, d: NonNull<FreeBlockDescr>, size: usize) {
        if let Some(v) = self.free_by_size.get_mut(&size) {
            if let Some(pos) = v.iter().position(|&x| x == d) {
                v.swap_remove(pos);
            }
            if v.is_empty() {
                self.free_by_size.remove(&size);
            }
        }
    }

    // -- sysmem bookkeeping ----------------------------------------------

    fn overlapping_sysmem(&self, start: usize, end: usize) -> Vec<NonNull<SysmemDescr>> {
        let mut out = Vec::new();
        if let Some((_, &d)) = self.sysmem_by_addr.range(..=start).next_back() {
            let r = unsafe { d.as_ref() };
            if r.addr + r.size > start {
                out.push(d);
            }
        }
        for (&addr, &d) in self.sysmem_by_addr.range(start.saturating_add(1)..end) {
            let _ = addr;
            out.push(d);
        }
        out
    }

    fn adjust_sysmem_allocated(&mut self, start: usize, end: usize, grow: bool) {
        for d in self.overlapping_sysmem(start, end) {
            unsafe {
                let r = &mut *d.as_ptr();
                let overlap_start = start.max(r.addr);
                let overlap_end = end.min(r.addr + r.size);
                let overlap = overlap_end.saturating_sub(overlap_start);
                if grow {
                    r.allocated += overlap;
                } else {
                    r.allocated -= overlap;
                }
            }
        }
    }

    fn release_empty_sysmem_ranges(&mut self, candidates: Vec<NonNull<SysmemDescr>>) {
        for d in candidates {
            let (addr, size, allocated, offset) = unsafe {
                let r = d.as_ref();
                (r.addr, r.size, r.allocated, r.offset)
            };
            if allocated == 0 {
                self.sysmem_by_addr.remove(&addr);
                unsafe {
                    if let Some((base, _)) = self.sysmem_pool.release(d, offset) {
                        self.sysmem_pool.finish_release(base);
                        sysmem::deallocate_sysmem(base, self.config.sysmem_pool_size);
                    }
                    sysmem::deallocate_sysmem(NonNull::new_unchecked(addr as *mut u8), size);
                }
                tracing::debug!(addr = format!("{addr:#x}"), size, "sysmem range released to OS");
            }
        }
    }

    fn alloc_fbd(&mut self) -> (NonNull<FreeBlockDescr>, u32) {
        if let Some(pair) = self.fbd_pool.acquire() {
            return pair;
        }
        let slab = sysmem::allocate_sysmem(self.config.block_pool_size)
            .unwrap_or_else(|| invariant_violation("out of memory growing free-block descriptor pool"));
        unsafe { self.fbd_pool.create_pool(slab, self.config.block_pool_size) };
        self.fbd_pool.acquire().expect("freshly created pool has capacity")
    }

    fn alloc_smd(&mut self) -> (NonNull<SysmemDescr>, u32) {
        if let Some(pair) = self.sysmem_pool.acquire() {
            return pair;
        }
        let slab = sysmem::allocate_sysmem(self.config.sysmem_pool_size)
            .unwrap_or_else(|| invariant_violation("out of memory growing sysmem descriptor pool"));
        unsafe { self.sysmem_pool.create_pool(slab, self.config.sysmem_pool_size) };
        self.sysmem_pool.acquire().expect("freshly created pool has capacity")
    }

    fn total_free_bytes(&self) -> usize {
        self.free_by_addr.values().map(|&d| unsafe { d.as_ref().size }).sum()
    }

    // -- debug inspection (invariants 1, 5) -------------------------------

    pub fn free_block_ranges(&self) -> Vec<(usize, usize)> {
        self.free_by_addr.iter().map(|(&a, &d)| (a, unsafe { d.as_ref().size })).collect()
    }

    pub fn sysmem_ranges(&self) -> Vec<(usize, usize, usize)> {
        self.sysmem_by_addr
            .iter()
            .map(|(&a, &d)| unsafe { (a, d.as_ref().size, d.as_ref().allocated) })
            .collect()
    }
}

impl crate::slab_source::SlabSource for PageAllocator {
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

impl Drop for PageAllocator {
    fn drop(&mut self) {
        let addrs: Vec<usize> = self.sysmem_by_addr.keys().copied().collect();
        for addr in addrs {
            if let Some(&d) = self.sysmem_by_addr.get(&addr) {
                let size = unsafe { d.as_ref().size };
                unsafe { sysmem::deallocate_sysmem(NonNull::new_unchecked(addr as *mut u8), size) };
            }
        }
    }
}

// SAFETY: all raw pointers stored here point into exclusively-owned,
// unshared-outside-the-mutex memory.
unsafe impl Send for PageAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> Config {
        Config {
            page_size: 64,
            min_block_size: 64 * 15,
            block_pool_size: 64 * 4,
            sysmem_pool_size: 64 * 4,
            ..Config::default()
        }
    }

    #[test]
    fn allocate_and_free_round_trips() {
        let mut pa = PageAllocator::new(tiny_config());
        let p = pa.allocate(128).unwrap();
        assert!(pa.free_block_ranges().iter().all(|&(_, s)| s > 0));
        pa.deallocate(p, 128);
        let sysmem_allocated_total: usize = pa.sysmem_ranges().iter().map(|&(_, _, a)| a).sum();
        assert_eq!(sysmem_allocated_total, 0);
    }

    #[test]
    fn reallocate_in_place_when_right_neighbor_covers_growth() {
        let mut pa = PageAllocator::new(tiny_config());
        let p1 = pa.allocate(64).unwrap();
        let p2 = pa.allocate(64).unwrap();
        pa.deallocate(p2, 64);
        let grown = pa.reallocate(p1, 64, 128).unwrap();
        assert_eq!(grown.as_ptr(), p1.as_ptr());
    }

    #[test]
    fn adopt_merges_free_ranges_and_release_mem_returns_everything() {
        let mut a = PageAllocator::new(tiny_config());
        let mut b = PageAllocator::new(tiny_config());

        let a1 = a.allocate(64).unwrap();
        let a2 = a.allocate(64).unwrap();
        a.deallocate(a1, 64);
        a.deallocate(a2, 64);

        let b1 = b.allocate(64).unwrap();
        b.deallocate(b1, 64);

        a.adopt(&mut b);
        a.release_mem();
        let allocated_total: usize = a.sysmem_ranges().iter().map(|&(_, _, al)| al).sum();
        assert_eq!(allocated_total, 0);
    }
}
