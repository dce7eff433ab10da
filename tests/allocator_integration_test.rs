// Allocator integration tests — exercise the composed Allocator (pool
// allocator over the cached layer over the page allocator) the way a
// caller linking against the crate would.
//
// Scenarios 1-3 from the component design describe exact block offsets
// tied to the original allocator's specific free-block tie-breaking order;
// this crate's BTreeMap-based indices pick differently among equally
// eligible blocks (explicitly sanctioned — see DESIGN.md), so these tests
// check the invariants the scenarios exist to exercise rather than the
// literal offsets.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::Once;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cuwalloc::{new_allocator, Config};

static TRACING_INIT: Once = Once::new();

/// Installs a `fmt` subscriber once per test binary, matching the teacher's
/// `main.rs` setup, so the `tracing::debug!`/`trace!` spans emitted by the
/// allocator are visible under `cargo test -- --nocapture`.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .with_test_writer()
            .init();
    });
}

// SCEN-001: coalescing round trip — allocate, fragment, free everything,
// and the page allocator must end up with no more outstanding sysmem ranges
// than it started with once the pool layer has released every chunk.
#[test]
fn scen_001_pool_round_trip_returns_all_chunks() {
    init_tracing();
    let mut alloc = new_allocator(Config::default());

    let mut ptrs: Vec<NonNull<u8>> = (0..16).map(|i| alloc.malloc(64).unwrap_or_else(|| panic!("alloc {i} failed"))).collect();
    for (i, &p) in ptrs.iter().enumerate() {
        unsafe { std::ptr::write_bytes(p.as_ptr(), i as u8, 64) };
    }
    assert_eq!(alloc.live_allocation_count(), ptrs.len());

    for p in ptrs.drain(..) {
        alloc.free(p);
    }
    assert_eq!(alloc.live_allocation_count(), 0);

    // re-allocate after a full drain must succeed (pools were reclaimed, not leaked)
    for _ in 0..16 {
        alloc.malloc(64).unwrap();
    }
}

// SCEN-002: reallocate in place when possible, copy when not, and contents
// must survive both paths.
#[test]
fn scen_002_reallocate_grows_in_place_and_across_classes() {
    init_tracing();
    let mut alloc = new_allocator(Config::default());

    let p = alloc.malloc(2).unwrap();
    unsafe { *p.as_ptr() = 0xAA };
    let p = alloc.realloc_ext(p, 2, 4, 0, 0).unwrap();
    assert_eq!(unsafe { *p.as_ptr() }, 0xAA);
    alloc.free(p);

    let q = alloc.malloc(2).unwrap();
    unsafe { *q.as_ptr() = 0x55 };
    let q = alloc.realloc_ext(q, 2, 4096, 0, 0).unwrap();
    assert_eq!(unsafe { *q.as_ptr() }, 0x55);
    alloc.free(q);
}

// SCEN-003: two independently-populated allocators merge cleanly and the
// merged allocator can release every byte of underlying memory back to the
// OS once everything is freed.
#[test]
fn scen_003_adopt_merges_and_release_mem_reclaims_everything() {
    init_tracing();
    let config = Config::default();
    let mut a = new_allocator(config);
    let mut b = new_allocator(config);

    let a_ptrs: Vec<_> = (0..3).map(|_| a.malloc(64).unwrap()).collect();
    let b_ptrs: Vec<_> = (0..3).map(|_| b.malloc(64).unwrap()).collect();
    for p in a_ptrs {
        a.free(p);
    }
    for p in b_ptrs {
        b.free(p);
    }

    cuwalloc::adopt(&mut a, &mut b);
    assert_eq!(a.live_allocation_count(), 0);
    assert_eq!(b.live_allocation_count(), 0);

    a.slabs_mut().inner_mut().release_mem();
    assert!(a.slabs_mut().inner_mut().sysmem_ranges().iter().all(|&(_, _, allocated)| allocated == 0));
}

// SCEN-004: a pool entry drains and refills repeatedly, and the
// alternating free pattern still returns every descriptor to empty.
#[test]
fn scen_004_pool_entry_drains_and_refills_with_alternating_frees() {
    init_tracing();
    let mut alloc = new_allocator(Config::default());

    let mut ptrs: Vec<NonNull<u8>> = (0..16)
        .map(|i| {
            let p = alloc.malloc(64).unwrap();
            unsafe { *p.as_ptr() = i as u8 };
            p
        })
        .collect();

    for (i, &p) in ptrs.iter().enumerate() {
        assert_eq!(unsafe { *p.as_ptr() }, i as u8);
    }

    for p in ptrs.drain(..) {
        alloc.free(p);
    }

    let refilled: Vec<_> = (0..16).map(|_| alloc.malloc(64).unwrap()).collect();
    assert_eq!(alloc.live_allocation_count(), 16);

    for (i, &p) in refilled.iter().enumerate() {
        if i % 2 == 0 {
            alloc.free(p);
        }
    }
    for (i, &p) in refilled.iter().enumerate() {
        if i % 2 != 0 {
            alloc.free(p);
        }
    }
    assert_eq!(alloc.live_allocation_count(), 0);
}

// SCEN-005: cached layer retains freed slabs and a sequence of requests
// that keeps landing under the largest retained slot stays cache-served,
// matching the strict greater-than fit rule in cache.rs.
#[test]
fn scen_005_cached_layer_serves_growing_sequence_then_falls_through() {
    init_tracing();
    use cuwalloc::cache::CachedAlloc;
    use cuwalloc::page_alloc::PageAllocator;

    let config = Config { cache_slots: 4, min_slot_size: 1, max_slot_size: 256, ..Config::default() };
    let mut cache = CachedAlloc::new(PageAllocator::new(config), 4, 1, 256);

    let mut filled = Vec::new();
    for _ in 0..4 {
        let p = cache.inner_mut().acquire_slab(256).unwrap();
        filled.push(p);
    }
    for p in filled {
        cache.deallocate(p, 256);
    }
    assert_eq!(cache.slot_count(), 4);

    let mut misses = 0;
    let mut size = 1usize;
    while size <= 256 {
        if cache.allocate(size).is_none() {
            misses += 1;
        }
        size *= 2;
    }
    assert_eq!(misses, 1, "only the final, exact max-size request should miss every slot");

    cache.flush_slots();
    assert_eq!(cache.slot_count(), 0);
}

// SCEN-006: random mix of allocate/free across the full request range never
// produces an aliasing pointer and leaves nothing live once everything is freed.
#[test]
fn scen_006_random_mix_holds_no_aliasing_and_drains_cleanly() {
    init_tracing();
    let mut alloc = new_allocator(Config::default());
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
    let mut seen_addrs: HashSet<usize> = HashSet::new();

    for _ in 0..(1 << 10) {
        if live.is_empty() || rng.random_bool(0.6) {
            let size = rng.random_range(1..=1024);
            let p = alloc.malloc(size).unwrap();
            assert!(seen_addrs.insert(p.as_ptr() as usize), "allocator handed out an address already live");
            live.push((p, size));
        } else {
            let idx = rng.random_range(0..live.len());
            let (p, _) = live.swap_remove(idx);
            seen_addrs.remove(&(p.as_ptr() as usize));
            alloc.free(p);
        }
    }

    for (p, _) in live {
        alloc.free(p);
    }
    assert_eq!(alloc.live_allocation_count(), 0);
}
