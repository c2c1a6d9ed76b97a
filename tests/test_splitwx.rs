// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

//! Split W^X end to end: real dual mappings, so these tests skip
//! themselves on hosts without anonymous memory file support.

use std::sync::Arc;

use codecache::{
    region::CacheError, slab::SlabError, CacheConfig, CodeCache, SplitWx, TranslationBlock,
};

mod utils;

const MIB: usize = 1024 * 1024;

fn split_cache() -> Option<CodeCache> {
    utils::init_logging();
    let config = CacheConfig {
        buffer_size: 4 * MIB,
        splitwx: SplitWx::On,
        max_threads: 2,
        ..CacheConfig::default()
    };
    match CodeCache::new(&config) {
        Ok(cache) => Some(cache),
        Err(CacheError::Backing(SlabError::SplitWxUnsupported { source })) => {
            eprintln!("skipping: split W^X unavailable on this host ({source})");
            None
        }
        Err(err) => panic!("{err}"),
    }
}

#[test]
fn views_alias_the_same_bytes() {
    let Some(cache) = split_cache() else { return };
    assert!(cache.slab().splitwx_enabled());

    let ctx = cache.register_context();
    let start = ctx.advance(16);
    // Emit through the writable view, fetch through the executable one.
    unsafe { (start.0 as *mut u8).write(0xd6) };
    let rx = cache.slab().rw_to_rx(start);
    let fetched = unsafe { (rx.0 as *const u8).read() };
    assert_eq!(fetched, 0xd6);
}

#[test]
fn lookup_accepts_either_view() {
    let Some(cache) = split_cache() else { return };
    let ctx = cache.register_context();

    let block = Arc::new(TranslationBlock {
        start: ctx.advance(64),
        size: 64,
        guest_pc: 0x8000_0000,
    });
    cache.tb_insert(Arc::clone(&block));

    // A faulting program counter arrives as an executable-view address.
    let rx = cache.slab().rw_to_rx(block.start);
    let hit = cache.tb_lookup(rx.0 + 16).expect("alias of an indexed block");
    assert!(Arc::ptr_eq(&hit, &block));
    let hit = cache.tb_lookup(block.start.0 + 16).expect("writable view");
    assert!(Arc::ptr_eq(&hit, &block));
    assert!(cache.tb_lookup(rx.0 + 64).is_none());

    // Round-tripping an address across the views is the identity.
    assert_eq!(cache.slab().rx_to_rw(rx), block.start);
}

#[test]
fn auto_always_produces_a_cache() {
    utils::init_logging();
    let config = CacheConfig {
        buffer_size: 2 * MIB,
        splitwx: SplitWx::Auto,
        ..CacheConfig::default()
    };
    // Auto falls back to a single mapping rather than failing.
    let cache = CodeCache::new(&config).expect("fallback path");
    let ctx = cache.register_context();
    assert_eq!(ctx.base().0, cache.slab().base());
}

#[test]
fn single_mapping_has_no_alias_offset() {
    utils::init_logging();
    let config = CacheConfig {
        buffer_size: 2 * MIB,
        splitwx: SplitWx::Off,
        ..CacheConfig::default()
    };
    let cache = CodeCache::new(&config).expect("anonymous rwx mapping");
    assert!(!cache.slab().splitwx_enabled());
    assert_eq!(cache.slab().splitwx_diff(), 0);
    let rw = codecache::RwAddr(cache.slab().base() + 8);
    assert_eq!(cache.slab().rw_to_rx(rw).0, rw.0);
}
