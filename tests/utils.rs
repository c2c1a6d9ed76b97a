// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

#![allow(dead_code)]

use std::sync::Once;

use codecache::{CacheConfig, CodeCache, Slab};

static INIT_STDERR_LOGGING: Once = Once::new();

pub fn init_logging() {
    INIT_STDERR_LOGGING.call_once(|| {
        _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A cache over a plain read/write mapping; no executable memory is
/// created, which keeps these tests runnable under hardened kernels.
pub fn plain_cache(size: usize, config: &CacheConfig) -> CodeCache {
    init_logging();
    let slab = Slab::plain(size).expect("anonymous mapping");
    CodeCache::with_slab(slab, config).expect("partitioning")
}
