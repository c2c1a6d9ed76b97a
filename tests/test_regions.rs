// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

//! Partitioning, region assignment and accounting, over a plain
//! read/write slab so no executable mappings are needed.

use codecache::{region::HIGHWATER_RESERVE, CacheConfig, CodeCache, Slab};

mod utils;

const MIB: usize = 1024 * 1024;

fn config(max_threads: usize) -> CacheConfig {
    CacheConfig {
        max_threads,
        // Small regions keep the test mappings small.
        region_floor: 128 * 1024,
        ..CacheConfig::default()
    }
}

#[test]
fn single_thread_gets_one_region() {
    let cache = utils::plain_cache(8 * MIB, &config(1));
    assert_eq!(cache.region_count(), 1);

    let (start, end) = cache.region_bounds(0);
    assert_eq!(start.0, cache.slab().base());
    // Usable area plus trailing guard page spans the whole slab.
    assert_eq!(cache.code_capacity(), end.0 - start.0 - HIGHWATER_RESERVE);
}

#[test]
fn multi_thread_partitioning() {
    // 8 MiB over 4 threads at a 128 KiB floor: 64 candidate regions,
    // capped at 8 per thread.
    let cache = utils::plain_cache(8 * MIB, &config(4));
    assert_eq!(cache.region_count(), 32);

    // Region bounds tile the buffer: each usable range followed by a
    // gap for its guard page.
    let mut prev_end = None;
    for idx in 0..cache.region_count() {
        let (start, end) = cache.region_bounds(idx);
        assert!(start.0 < end.0);
        if let Some(prev) = prev_end {
            assert!(start.0 > prev, "regions overlap");
        }
        prev_end = Some(end.0);
    }
}

#[test]
fn region_floor_wins_over_thread_count() {
    // 1 MiB over 16 threads still yields 16 regions, under the floor.
    let cache = utils::plain_cache(MIB, &config(16));
    assert_eq!(cache.region_count(), 16);
}

#[test]
fn tiny_slab_is_rejected() {
    utils::init_logging();
    let page = 4096;
    let slab = Slab::plain(4 * page).expect("anonymous mapping");
    let bad = CacheConfig {
        max_threads: 4,
        region_floor: page,
        ..CacheConfig::default()
    };
    // 4 threads over 4 pages leaves one page per region, with no room
    // for both a usable page and the guard.
    assert!(CodeCache::with_slab(slab, &bad).is_err());
}

#[test]
fn exhaustion_and_reset() {
    let cache = utils::plain_cache(MIB, &config(2));
    assert_eq!(cache.region_count(), 8);

    let a = cache.register_context();
    let b = cache.register_context();
    // Two regions handed out at registration; drain the other six.
    for _ in 0..6 {
        assert!(!cache.alloc_region(&a));
    }
    assert!(cache.alloc_region(&a));
    assert!(cache.alloc_region(&b));
    // Out-of-space is sticky until a flush.
    assert!(cache.alloc_region(&a));

    // Regions handed back count as fully used, minus their reserve.
    let (start, end) = cache.region_bounds(0);
    assert_eq!(cache.code_size(), 6 * (end.0 - start.0 - HIGHWATER_RESERVE));

    cache.reset_all();
    assert_eq!(cache.code_size(), 0);
    assert_eq!(cache.tb_count(), 0);
    // Both contexts are seated again, from region 0 up.
    assert_eq!(a.base(), start);
    assert!(!cache.alloc_region(&a));
}

#[test]
fn prologue_shrinks_region_zero() {
    let cache = utils::plain_cache(MIB, &config(2));
    let ctx = cache.register_context();
    assert_eq!(ctx.base().0, cache.slab().base());
    assert!(cache.prologue_tail().is_none());

    let prologue = ctx.advance(0x160);
    assert_eq!(prologue.0, cache.slab().base());
    cache.prologue_installed(&ctx);

    // The context restarts just past the prologue, and keeps that
    // start across flushes.
    let after = cache.slab().base() + 0x160;
    assert_eq!(ctx.base().0, after);
    assert_eq!(cache.region_bounds(0).0 .0, after);
    cache.reset_all();
    assert_eq!(ctx.base().0, after);

    let (tail, tail_len) = cache.prologue_tail().expect("recorded at install");
    assert_eq!(tail.0, after);
    let last = cache.region_bounds(cache.region_count() - 1).1;
    assert_eq!(after + tail_len, last.0);
}

#[test]
fn code_size_never_exceeds_capacity() {
    let cache = utils::plain_cache(2 * MIB, &config(4));
    let contexts: Vec<_> = (0..4).map(|_| cache.register_context()).collect();
    std::thread::scope(|s| {
        for ctx in &contexts {
            s.spawn(|| loop {
                if ctx.over_highwater() && cache.alloc_region(ctx) {
                    break;
                }
                ctx.advance(96);
            });
        }
        for _ in 0..1000 {
            let size = cache.code_size();
            assert!(
                size <= cache.code_capacity(),
                "{size} bytes reported against {} capacity",
                cache.code_capacity()
            );
        }
    });
    // All regions drained; usage settles at full capacity at most.
    assert!(cache.code_size() <= cache.code_capacity());
    assert!(cache.alloc_region(&contexts[0]));
}
