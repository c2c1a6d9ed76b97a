// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

//! A region allocator and reverse-lookup index for JIT-generated code.
//!
//! A single large executable buffer (the *slab*, see [`slab::Slab`]) is
//! partitioned into equally sized *regions*, each ending in an
//! inaccessible guard page. Translator threads are handed whole regions
//! on demand ([`region::CodeCache::alloc_region`]) so that emitting code
//! into a thread's current region needs no synchronization at all.
//! Completed translations are indexed per region by their
//! `[start, start + size)` byte span ([`blocks::BlockIndex`]) so that a
//! host program counter can be mapped back to the
//! [`blocks::TranslationBlock`] containing it.
//!
//! The slab may be mapped twice under split W^X: one writable view, one
//! executable view of the same pages, related by a constant offset. See
//! [`slab::RwAddr`] and [`slab::RxAddr`].

pub mod blocks;
pub mod interval_map;
pub mod region;
pub mod slab;

pub use blocks::TranslationBlock;
pub use region::{CacheConfig, CodeCache, TranslatorContext};
pub use slab::{RwAddr, RxAddr, Slab, SplitWx};
