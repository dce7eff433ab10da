//! Pool allocator (4.3): routes small and mid-sized requests to fixed-size
//! chunk pools, with a byte pool for 1-byte allocations, pow2 pools for
//! everything up to the top pow2 class, a handful of auxiliary non-pow2
//! classes to cut internal fragmentation, and raw bins for everything above
//! that — served directly by whatever [`SlabSource`] backs this allocator.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::config::{self, Config};
use crate::descriptor_pool::DescriptorPool;
use crate::error::{invariant_violation, unknown_pointer, AllocError, Result};
use crate::slab_source::SlabSource;
use crate::sysmem;

/// Non-pow2 chunk sizes carved in between the pow2 classes, each strictly
/// smaller than the pow2 class above it. An approximation of the source
/// allocator's template-generated auxiliary classes — see DESIGN.md.
const AUX_CHUNK_SIZES: [usize; 12] = [3, 6, 12, 24, 48, 96, 192, 384, 768, 1536, 3072, 6144];

const CHUNK_HEAD_EMPTY: u32 = 0xFFFF;

static ZERO_ALLOC_BYTE: u8 = 0;

/// The sentinel returned for zero-size requests: a stable, non-null, never
/// written address that `free`/`realloc` recognize without a descriptor
/// lookup.
pub fn zero_alloc_ptr() -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(&ZERO_ALLOC_BYTE as *const u8 as *mut u8) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescrKind {
    Pool,
    PoolAux,
    PoolBytes,
    Raw,
}

#[repr(C)]
struct AllocDescr {
    offset: u32,
    kind: DescrKind,
    /// Concrete chunk size for `Pool`/`PoolAux`/`PoolBytes`; alignment log
    /// for `Raw` (the source design's `chunk_size` field packs a base-2 log
    /// only because its pools are pow2-only — ours also has non-pow2 aux
    /// classes, so this stores the literal chunk size instead).
    chunk_size: u32,
    size: usize,
    capacity: u32,
    used: u32,
    count: u32,
    head: u32,
    data: NonNull<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeClass {
    Pow2(u32),
    Aux(usize),
    Raw,
}

struct PoolEntry {
    free_pools: Vec<NonNull<AllocDescr>>,
    full_pools: Vec<NonNull<AllocDescr>>,
}

impl PoolEntry {
    fn new() -> Self {
        Self { free_pools: Vec::new(), full_pools: Vec::new() }
    }

    fn adopt(&mut self, other: &mut PoolEntry) {
        self.free_pools.append(&mut other.free_pools);
        self.full_pools.append(&mut other.full_pools);
    }
}

struct ByteAllocator {
    entry: PoolEntry,
    available: Vec<NonNull<u8>>,
    full: Vec<NonNull<u8>>,
}

impl ByteAllocator {
    fn new() -> Self {
        Self { entry: PoolEntry::new(), available: Vec::new(), full: Vec::new() }
    }

    fn adopt(&mut self, other: &mut ByteAllocator) {
        self.entry.adopt(&mut other.entry);
        self.available.append(&mut other.available);
        self.full.append(&mut other.full);
    }
}

fn pool_slab_size(config: &Config, chunk_size: usize) -> usize {
    let base = 1usize << config.min_pool_power;
    base.max(chunk_size * 2).max(config.page_size)
}

fn acquire_descr(config: &Config, descr_pool: &mut DescriptorPool<AllocDescr>) -> (NonNull<AllocDescr>, u32) {
    if let Some(pair) = descr_pool.acquire() {
        return pair;
    }
    let slab = sysmem::allocate_sysmem(config.alloc_descr_pool_size)
        .unwrap_or_else(|| invariant_violation("out of memory growing alloc-descriptor pool"));
    unsafe { descr_pool.create_pool(slab, config.alloc_descr_pool_size) };
    descr_pool.acquire().expect("freshly created descriptor pool has capacity")
}

unsafe fn release_descr(config: &Config, descr_pool: &mut DescriptorPool<AllocDescr>, d: NonNull<AllocDescr>, offset: u32) {
    if let Some((base, size)) = descr_pool.release(d, offset) {
        descr_pool.finish_release(base);
        sysmem::deallocate_sysmem(base, size.max(config.alloc_descr_pool_size));
    }
}

/// Pop a free chunk from `entry`, pulling a fresh slab from `slabs` when
/// every pool it owns is full.
fn entry_acquire_chunk<S: SlabSource>(
    entry: &mut PoolEntry,
    kind: DescrKind,
    chunk_size: usize,
    slab_size: usize,
    config: &Config,
    descr_pool: &mut DescriptorPool<AllocDescr>,
    slabs: &mut S,
    central_addr: &mut BTreeMap<usize, NonNull<AllocDescr>>,
) -> Option<NonNull<u8>> {
    if entry.free_pools.is_empty() {
        let slab = slabs.acquire_slab(slab_size)?;
        let capacity = (slab_size / chunk_size) as u32;
        let (rec, offset) = acquire_descr(config, descr_pool);
        unsafe {
            *rec.as_ptr() = AllocDescr {
                offset,
                kind,
                chunk_size: chunk_size as u32,
                size: slab_size,
                capacity,
                used: 0,
                count: 0,
                head: CHUNK_HEAD_EMPTY,
                data: slab,
            };
        }
        central_addr.insert(slab.as_ptr() as usize, rec);
        entry.free_pools.push(rec);
    }

    let descr_ptr = *entry.free_pools.last().unwrap();
    let descr = unsafe { &mut *descr_ptr.as_ptr() };
    let idx = if descr.head != CHUNK_HEAD_EMPTY {
        let i = descr.head;
        let chunk = unsafe { descr.data.as_ptr().add(i as usize * chunk_size) };
        descr.head = unsafe { *(chunk as *const u16) as u32 };
        i
    } else {
        debug_assert!(descr.used < descr.capacity);
        let i = descr.used;
        descr.used += 1;
        i
    };
    descr.count += 1;
    if descr.count == descr.capacity {
        entry.free_pools.pop();
        entry.full_pools.push(descr_ptr);
    }

    let chunk_ptr = unsafe { descr.data.as_ptr().add(idx as usize * chunk_size) };
    Some(unsafe { NonNull::new_unchecked(chunk_ptr) })
}

/// Return a chunk to its owning descriptor, releasing the slab back to
/// `slabs` (and the descriptor itself) once the pool drains to empty.
fn entry_release_chunk<S: SlabSource>(
    entry: &mut PoolEntry,
    descr_ptr: NonNull<AllocDescr>,
    ptr: NonNull<u8>,
    chunk_size: usize,
    config: &Config,
    descr_pool: &mut DescriptorPool<AllocDescr>,
    slabs: &mut S,
    central_addr: &mut BTreeMap<usize, NonNull<AllocDescr>>,
) {
    let descr = unsafe { &mut *descr_ptr.as_ptr() };
    let idx = unsafe { (ptr.as_ptr().offset_from(descr.data.as_ptr()) as usize / chunk_size) as u16 };
    let was_full = descr.count == descr.capacity;

    unsafe { *(ptr.as_ptr() as *mut u16) = descr.head as u16 };
    descr.head = idx as u32;
    descr.count -= 1;

    if was_full {
        if let Some(pos) = entry.full_pools.iter().position(|&d| d == descr_ptr) {
            entry.full_pools.swap_remove(pos);
        }
        entry.free_pools.push(descr_ptr);
    }

    if descr.count == 0 {
        if let Some(pos) = entry.free_pools.iter().position(|&d| d == descr_ptr) {
            entry.free_pools.swap_remove(pos);
        }
        let data = descr.data;
        let size = descr.size;
        let offset = descr.offset;
        central_addr.remove(&(data.as_ptr() as usize));
        slabs.release_slab(data, size);
        unsafe { release_descr(config, descr_pool, descr_ptr, offset) };
    }
}

pub struct PoolAllocator<S> {
    config: Config,
    slabs: S,
    descr_pool: DescriptorPool<AllocDescr>,
    central_addr: BTreeMap<usize, NonNull<AllocDescr>>,
    byte_pool: ByteAllocator,
    pow2_pools: Vec<PoolEntry>,
    aux_pools: BTreeMap<usize, PoolEntry>,
    raw_bins: Vec<Vec<NonNull<AllocDescr>>>,
}

impl<S: SlabSource> PoolAllocator<S> {
    pub fn new(config: Config, slabs: S) -> Self {
        let pow2_count = (config.max_chunk_size_log2 - config.min_chunk_size_log2 + 1) as usize;
        Self {
            raw_bins: (0..config.raw_bin_count).map(|_| Vec::new()).collect(),
            pow2_pools: (0..pow2_count).map(|_| PoolEntry::new()).collect(),
            byte_pool: ByteAllocator::new(),
            aux_pools: BTreeMap::new(),
            central_addr: BTreeMap::new(),
            descr_pool: DescriptorPool::new(),
            config,
            slabs,
        }
    }

    pub fn slabs_mut(&mut self) -> &mut S {
        &mut self.slabs
    }

    pub fn slabs(&self) -> &S {
        &self.slabs
    }

    pub fn live_allocation_count(&self) -> usize {
        self.central_addr.len()
    }

    fn classify(&self, size: usize, alignment: usize) -> SizeClass {
        debug_assert!(size > 1);
        let align = alignment.max(1).min(self.config.page_size);
        let size_aligned = config::align_value(size, align);
        let log2 = config::ceil_log2(size_aligned).max(self.config.min_chunk_size_log2);
        if log2 > self.config.max_chunk_size_log2 {
            return SizeClass::Raw;
        }
        let pow2_size = 1usize << log2;
        if let Some(&aux) =
            AUX_CHUNK_SIZES.iter().find(|&&a| a >= size_aligned && a < pow2_size && a % align == 0)
        {
            return SizeClass::Aux(aux);
        }
        SizeClass::Pow2(log2)
    }

    fn raw_bin_index(&self, size: usize) -> usize {
        let base = 1usize << (self.config.max_chunk_size_log2 + 1);
        let mut idx = 0usize;
        while idx + 1 < self.config.raw_bin_count && (base << idx) < size {
            idx += 1;
        }
        idx
    }

    fn find_descr(&self, addr: usize) -> Option<NonNull<AllocDescr>> {
        let (_, &d) = self.central_addr.range(..=addr).next_back()?;
        let r = unsafe { d.as_ref() };
        let start = r.data.as_ptr() as usize;
        if addr >= start && addr < start + r.size.max(1) {
            Some(d)
        } else {
            None
        }
    }

    fn byte_acquire(&mut self) -> Option<NonNull<u8>> {
        if self.byte_pool.available.is_empty() {
            let slab_size = pool_slab_size(&self.config, config::BYTE_POOL_CHUNK_SIZE);
            let chunk = entry_acquire_chunk(
                &mut self.byte_pool.entry,
                DescrKind::PoolBytes,
                config::BYTE_POOL_CHUNK_SIZE,
                slab_size,
                &self.config,
                &mut self.descr_pool,
                &mut self.slabs,
                &mut self.central_addr,
            )?;
            unsafe { *(chunk.as_ptr().add(2) as *mut u16) = config::BYTE_POOL_SENTINEL_BITS };
            self.byte_pool.available.push(chunk);
        }

        let sub = *self.byte_pool.available.last().unwrap();
        let mask_ptr = unsafe { sub.as_ptr().add(2) as *mut u16 };
        let mask = unsafe { *mask_ptr };
        let bit = (!mask).trailing_zeros();
        debug_assert!(bit < config::BYTE_POOL_SLOTS);
        let new_mask = mask | (1u16 << bit);
        unsafe { *mask_ptr = new_mask };
        if new_mask == config::BYTE_POOL_FULL_MASK {
            self.byte_pool.available.pop();
            self.byte_pool.full.push(sub);
        }
        Some(unsafe { NonNull::new_unchecked(sub.as_ptr().add(4 + bit as usize)) })
    }

    fn byte_release(&mut self, descr_ptr: NonNull<AllocDescr>, ptr: NonNull<u8>) {
        let sub_addr = (ptr.as_ptr() as usize) & !(config::BYTE_POOL_CHUNK_SIZE - 1);
        let sub = unsafe { NonNull::new_unchecked(sub_addr as *mut u8) };
        let bit = (ptr.as_ptr() as usize - sub_addr - 4) as u32;
        let mask_ptr = unsafe { sub.as_ptr().add(2) as *mut u16 };
        let was_full = unsafe { *mask_ptr } == config::BYTE_POOL_FULL_MASK;
        unsafe { *mask_ptr &= !(1u16 << bit) };
        let mask = unsafe { *mask_ptr };

        if was_full {
            if let Some(pos) = self.byte_pool.full.iter().position(|&s| s == sub) {
                self.byte_pool.full.swap_remove(pos);
            }
            self.byte_pool.available.push(sub);
        }

        if mask == config::BYTE_POOL_SENTINEL_BITS {
            if let Some(pos) = self.byte_pool.available.iter().position(|&s| s == sub) {
                self.byte_pool.available.swap_remove(pos);
            }
            entry_release_chunk(
                &mut self.byte_pool.entry,
                descr_ptr,
                sub,
                config::BYTE_POOL_CHUNK_SIZE,
                &self.config,
                &mut self.descr_pool,
                &mut self.slabs,
                &mut self.central_addr,
            );
        }
    }

    fn pow2_acquire(&mut self, log2: u32) -> Option<NonNull<u8>> {
        let idx = (log2 - self.config.min_chunk_size_log2) as usize;
        let chunk_size = 1usize << log2;
        let slab_size = pool_slab_size(&self.config, chunk_size);
        entry_acquire_chunk(
            &mut self.pow2_pools[idx],
            DescrKind::Pool,
            chunk_size,
            slab_size,
            &self.config,
            &mut self.descr_pool,
            &mut self.slabs,
            &mut self.central_addr,
        )
    }

    fn pow2_release(&mut self, descr_ptr: NonNull<AllocDescr>, ptr: NonNull<u8>) {
        let chunk_size = unsafe { descr_ptr.as_ref().chunk_size } as usize;
        let log2 = config::ceil_log2(chunk_size);
        let idx = (log2 - self.config.min_chunk_size_log2) as usize;
        entry_release_chunk(
            &mut self.pow2_pools[idx],
            descr_ptr,
            ptr,
            chunk_size,
            &self.config,
            &mut self.descr_pool,
            &mut self.slabs,
            &mut self.central_addr,
        );
    }

    fn aux_acquire(&mut self, chunk_size: usize) -> Option<NonNull<u8>> {
        let slab_size = pool_slab_size(&self.config, chunk_size);
        let entry = self.aux_pools.entry(chunk_size).or_insert_with(PoolEntry::new);
        entry_acquire_chunk(
            entry,
            DescrKind::PoolAux,
            chunk_size,
            slab_size,
            &self.config,
            &mut self.descr_pool,
            &mut self.slabs,
            &mut self.central_addr,
        )
    }

    fn aux_release(&mut self, descr_ptr: NonNull<AllocDescr>, ptr: NonNull<u8>) {
        let chunk_size = unsafe { descr_ptr.as_ref().chunk_size } as usize;
        if let Some(entry) = self.aux_pools.get_mut(&chunk_size) {
            entry_release_chunk(
                entry,
                descr_ptr,
                ptr,
                chunk_size,
                &self.config,
                &mut self.descr_pool,
                &mut self.slabs,
                &mut self.central_addr,
            );
        }
    }

    fn alloc_raw(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let align = alignment.max(1).min(self.config.page_size);
        let true_size = config::align_value(size, align);
        let ptr = self.slabs.acquire_slab(true_size)?;
        let (rec, offset) = acquire_descr(&self.config, &mut self.descr_pool);
        unsafe {
            *rec.as_ptr() = AllocDescr {
                offset,
                kind: DescrKind::Raw,
                chunk_size: config::ceil_log2(align.max(1)),
                size,
                capacity: 0,
                used: 0,
                count: 0,
                head: 0,
                data: ptr,
            };
        }
        self.central_addr.insert(ptr.as_ptr() as usize, rec);
        let bin = self.raw_bin_index(true_size);
        self.raw_bins[bin].push(rec);
        Some(ptr)
    }

    fn free_raw(&mut self, descr_ptr: NonNull<AllocDescr>) {
        let (data, size, align_log, offset) = unsafe {
            let d = descr_ptr.as_ref();
            (d.data, d.size, d.chunk_size, d.offset)
        };
        let true_size = config::align_value(size, 1usize << align_log);
        let bin = self.raw_bin_index(true_size);
        if let Some(pos) = self.raw_bins[bin].iter().position(|&d| d == descr_ptr) {
            self.raw_bins[bin].swap_remove(pos);
        }
        self.central_addr.remove(&(data.as_ptr() as usize));
        self.slabs.release_slab(data, true_size);
        unsafe { release_descr(&self.config, &mut self.descr_pool, descr_ptr, offset) };
    }

    fn realloc_raw(&mut self, descr_ptr: NonNull<AllocDescr>, new_size: usize) -> Option<NonNull<u8>> {
        let (data, old_size, align_log) = unsafe {
            let d = descr_ptr.as_ref();
            (d.data, d.size, d.chunk_size)
        };
        let alignment = 1usize << align_log;
        let old_true_size = config::align_value(old_size, alignment);
        let new_true_size = config::align_value(new_size, alignment);
        let old_bin = self.raw_bin_index(old_true_size);
        let new_ptr = self.slabs.resize_slab(data, old_true_size, new_true_size)?;

        self.central_addr.remove(&(data.as_ptr() as usize));
        self.central_addr.insert(new_ptr.as_ptr() as usize, descr_ptr);
        unsafe {
            let d = &mut *descr_ptr.as_ptr();
            d.data = new_ptr;
            d.size = new_size;
        }
        let new_bin = self.raw_bin_index(new_true_size);
        if new_bin != old_bin {
            if let Some(pos) = self.raw_bins[old_bin].iter().position(|&d| d == descr_ptr) {
                self.raw_bins[old_bin].swap_remove(pos);
            }
            self.raw_bins[new_bin].push(descr_ptr);
        }
        Some(new_ptr)
    }

    /// Serve a request for `size` bytes, routing through the byte pool, the
    /// pow2/aux pools, or a raw bin depending on size class.
    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.malloc_ext(size, 0, 0)
    }

    /// `flags` is reserved; only `0` is currently defined.
    pub fn malloc_ext(&mut self, size: usize, alignment: usize, flags: u32) -> Option<NonNull<u8>> {
        debug_assert_eq!(flags, 0, "flags is reserved, only 0 is defined");
        if size == 0 {
            return Some(zero_alloc_ptr());
        }
        let alignment = if alignment == 0 { self.config.basic_alignment } else { alignment };
        let alignment = alignment.min(self.config.page_size);
        if size == 1 && alignment <= config::BYTE_POOL_CHUNK_SIZE {
            return self.byte_acquire();
        }
        match self.classify(size, alignment) {
            SizeClass::Pow2(log2) => self.pow2_acquire(log2),
            SizeClass::Aux(chunk) => self.aux_acquire(chunk),
            SizeClass::Raw => self.alloc_raw(size, alignment),
        }
    }

    pub fn free(&mut self, ptr: NonNull<u8>) {
        self.free_ext(ptr, 0, 0, 0)
    }

    /// `size`/`alignment`/`flags` are accepted for parity with the extension
    /// surface's C-interop shims; this allocator always recovers the owning
    /// descriptor from `ptr` alone via the central address map, so they are
    /// not required to locate it.
    pub fn free_ext(&mut self, ptr: NonNull<u8>, _size: usize, _alignment: usize, flags: u32) {
        debug_assert_eq!(flags, 0, "flags is reserved, only 0 is defined");
        if ptr == zero_alloc_ptr() {
            return;
        }
        let addr = ptr.as_ptr() as usize;
        let descr_ptr = self.find_descr(addr).unwrap_or_else(|| unknown_pointer(addr));
        match unsafe { descr_ptr.as_ref().kind } {
            DescrKind::PoolBytes => self.byte_release(descr_ptr, ptr),
            DescrKind::Pool => self.pow2_release(descr_ptr, ptr),
            DescrKind::PoolAux => self.aux_release(descr_ptr, ptr),
            DescrKind::Raw => self.free_raw(descr_ptr),
        }
    }

    fn descr_served_size(&self, descr_ptr: NonNull<AllocDescr>, kind: DescrKind, old_size_hint: usize) -> usize {
        if old_size_hint > 0 {
            return old_size_hint;
        }
        match kind {
            DescrKind::PoolBytes => 1,
            DescrKind::Pool | DescrKind::PoolAux => unsafe { descr_ptr.as_ref().chunk_size as usize },
            DescrKind::Raw => unsafe { descr_ptr.as_ref().size },
        }
    }

    fn descr_same_class(&self, descr_ptr: NonNull<AllocDescr>, kind: DescrKind, new_class: SizeClass) -> bool {
        match (kind, new_class) {
            (DescrKind::Pool, SizeClass::Pow2(log2)) => {
                (1usize << log2) == unsafe { descr_ptr.as_ref().chunk_size as usize }
            }
            (DescrKind::PoolAux, SizeClass::Aux(chunk)) => unsafe { descr_ptr.as_ref().chunk_size as usize == chunk },
            _ => false,
        }
    }

    /// Grow or shrink an existing allocation. `old_size` is a caller-supplied
    /// hint used for the `memcpy` byte count on cross-class moves — per the
    /// source allocator's `realloc42`, this is the raw (user-visible) byte
    /// count, never a class-aligned size.
    pub fn realloc(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        self.realloc_ext(ptr, 0, new_size, 0, 0)
    }

    /// `flags` is reserved; only `0` is currently defined.
    pub fn realloc_ext(
        &mut self,
        ptr: NonNull<u8>,
        old_size_hint: usize,
        new_size: usize,
        alignment: usize,
        flags: u32,
    ) -> Option<NonNull<u8>> {
        debug_assert_eq!(flags, 0, "flags is reserved, only 0 is defined");
        if ptr == zero_alloc_ptr() {
            return self.malloc_ext(new_size, alignment, flags);
        }
        if new_size == 0 {
            self.free(ptr);
            return Some(zero_alloc_ptr());
        }

        let addr = ptr.as_ptr() as usize;
        let descr_ptr = self.find_descr(addr).unwrap_or_else(|| unknown_pointer(addr));
        let kind = unsafe { descr_ptr.as_ref().kind };
        let alignment = if alignment == 0 { self.config.basic_alignment } else { alignment };
        let alignment = alignment.min(self.config.page_size);

        if kind == DescrKind::Raw {
            let old_size = self.descr_served_size(descr_ptr, kind, old_size_hint);
            return match self.classify(new_size, alignment) {
                SizeClass::Raw => self.realloc_raw(descr_ptr, new_size),
                _ => {
                    let new_ptr = self.malloc_ext(new_size, alignment, flags)?;
                    unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size)) };
                    self.free_raw(descr_ptr);
                    Some(new_ptr)
                }
            };
        }

        if kind == DescrKind::PoolBytes && new_size == 1 {
            return Some(ptr);
        }

        let new_class = if new_size == 1 { SizeClass::Pow2(self.config.min_chunk_size_log2) } else { self.classify(new_size, alignment) };
        if self.descr_same_class(descr_ptr, kind, new_class) {
            return Some(ptr);
        }

        let old_size = self.descr_served_size(descr_ptr, kind, old_size_hint);
        let new_ptr = self.malloc_ext(new_size, alignment, flags)?;
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size)) };
        self.free(ptr);
        Some(new_ptr)
    }

    /// Fallible counterpart to [`malloc`](Self::malloc) for callers that want
    /// `Result` rather than a null/`None` return on OOM.
    pub fn try_malloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.malloc(size).ok_or(AllocError::OutOfMemory { requested: size })
    }

    /// Fallible counterpart to [`malloc_ext`](Self::malloc_ext).
    pub fn try_malloc_ext(&mut self, size: usize, alignment: usize, flags: u32) -> Result<NonNull<u8>> {
        self.malloc_ext(size, alignment, flags).ok_or(AllocError::OutOfMemory { requested: size })
    }

    /// Fallible counterpart to [`realloc`](Self::realloc).
    pub fn try_realloc(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        self.realloc(ptr, new_size).ok_or(AllocError::OutOfMemory { requested: new_size })
    }

    /// Fallible counterpart to [`realloc_ext`](Self::realloc_ext).
    pub fn try_realloc_ext(
        &mut self,
        ptr: NonNull<u8>,
        old_size_hint: usize,
        new_size: usize,
        alignment: usize,
        flags: u32,
    ) -> Result<NonNull<u8>> {
        self.realloc_ext(ptr, old_size_hint, new_size, alignment, flags)
            .ok_or(AllocError::OutOfMemory { requested: new_size })
    }

    /// Merge `other`'s bookkeeping into `self`. The underlying [`SlabSource`]
    /// (page allocator / cached layer) is not merged here — callers compose
    /// this with their own `adopt` on the slab source, since `S` carries no
    /// such requirement generically.
    pub fn adopt(&mut self, other: &mut Self) {
        for (&addr, &d) in other.central_addr.iter() {
            if self.central_addr.insert(addr, d).is_some() {
                invariant_violation("adopt: overlapping address ranges between pool allocators");
            }
        }
        other.central_addr.clear();

        self.descr_pool.adopt(&mut other.descr_pool);
        self.byte_pool.adopt(&mut other.byte_pool);

        for (a, b) in self.pow2_pools.iter_mut().zip(other.pow2_pools.iter_mut()) {
            a.adopt(b);
        }

        for (chunk_size, mut entry) in std::mem::take(&mut other.aux_pools) {
            self.aux_pools.entry(chunk_size).or_insert_with(PoolEntry::new).adopt(&mut entry);
        }

        for (bin, other_bin) in self.raw_bins.iter_mut().zip(other.raw_bins.iter_mut()) {
            bin.append(other_bin);
        }
    }
}

unsafe impl<S: Send> Send for PoolAllocator<S> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_alloc::PageAllocator;

    fn tiny_config() -> Config {
        let mut c = Config { page_size: 4096, min_pool_power: 12, max_pool_power: 14, ..Config::default() };
        c.min_block_size = 4096 * 4;
        c.block_pool_size = 4096;
        c.sysmem_pool_size = 4096;
        c.alloc_descr_pool_size = 4096;
        c
    }

    #[test]
    fn byte_pool_round_trips_many_single_byte_allocations() {
        let config = tiny_config();
        let mut pool = PoolAllocator::new(config, PageAllocator::new(config));
        let mut ptrs = Vec::new();
        for _ in 0..40 {
            ptrs.push(pool.malloc(1).unwrap());
        }
        for p in ptrs {
            pool.free(p);
        }
        assert_eq!(pool.live_allocation_count(), 0);
    }

    #[test]
    fn pow2_allocation_round_trips_and_reuses_freed_chunk() {
        let config = tiny_config();
        let mut pool = PoolAllocator::new(config, PageAllocator::new(config));
        let a = pool.malloc(100).unwrap();
        pool.free(a);
        let b = pool.malloc(100).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        pool.free(b);
    }

    #[test]
    fn large_request_routes_to_raw_bin_and_frees_cleanly() {
        let config = tiny_config();
        let mut pool = PoolAllocator::new(config, PageAllocator::new(config));
        let big = pool.malloc(1 << 16).unwrap();
        unsafe { *big.as_ptr() = 0xAB };
        pool.free(big);
        assert_eq!(pool.live_allocation_count(), 0);
    }

    #[test]
    fn realloc_grows_across_size_classes_and_preserves_contents() {
        let config = tiny_config();
        let mut pool = PoolAllocator::new(config, PageAllocator::new(config));
        let p = pool.malloc(8).unwrap();
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0x42, 8) };
        let grown = pool.realloc_ext(p, 8, 5000, 0, 0).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 8) };
        assert!(bytes.iter().all(|&b| b == 0x42));
        pool.free(grown);
    }

    #[test]
    fn zero_size_malloc_returns_sentinel_and_free_is_a_no_op() {
        let config = tiny_config();
        let mut pool = PoolAllocator::new(config, PageAllocator::new(config));
        let p = pool.malloc(0).unwrap();
        assert_eq!(p, zero_alloc_ptr());
        pool.free(p);
        assert_eq!(pool.live_allocation_count(), 0);
    }

    #[test]
    fn try_malloc_succeeds_and_reports_out_of_memory_as_a_result() {
        let config = tiny_config();
        let mut pool = PoolAllocator::new(config, PageAllocator::new(config));
        let p = pool.try_malloc(100).unwrap();
        pool.free(p);

        let err = pool.try_malloc(usize::MAX).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { requested } if requested == usize::MAX));
    }

    #[test]
    fn classify_clamps_alignment_to_the_page_size_before_choosing_a_class() {
        let config = Config::default();
        let pool = PoolAllocator::new(config, PageAllocator::new(config));
        // An alignment twice the page size must be clamped down to the page
        // size before class selection, landing one class below what the raw
        // (unclamped) alignment would otherwise select.
        assert_eq!(pool.classify(8, config.page_size * 2), SizeClass::Pow2(12));
    }
}
