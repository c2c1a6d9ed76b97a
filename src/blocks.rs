// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

//! Reverse lookup from host code addresses to translation metadata.
//!
//! Each region of the code cache owns one [`IntervalMap`] under its own
//! mutex, so index traffic for different regions never contends. A
//! translation is inserted and removed by the thread that owns the
//! enclosing region's write cursor; concurrent readers are lookups from
//! other threads (e.g. mapping a faulting program counter back to its
//! block).
//!
//! Lock order: point operations take exactly one region lock.
//! Multi-region operations ([`BlockIndex::for_each`],
//! [`BlockIndex::len`], [`BlockIndex::reset_all`]) take region locks in
//! ascending index order only. No block-index lock is ever held while
//! taking the partition lock in [`region`](crate::region).

use std::sync::{Arc, Mutex};

use crate::{
    interval_map::{IntervalMap, Span},
    slab::{RwAddr, RxAddr},
};

/// A finished unit of translated code, indexed by its address span.
///
/// `start` is always the writable-view address of the code; under split
/// W^X the executable alias differs by the slab's constant offset. The
/// remaining fields are opaque to the index.
pub struct TranslationBlock {
    /// First byte of the translated code, writable view.
    pub start: RwAddr,
    /// Length of the translated code in bytes.
    pub size: usize,
    /// Guest program counter this block was translated from.
    pub guest_pc: u64,
}

impl TranslationBlock {
    #[inline]
    pub const fn span(&self) -> Span {
        Span::new(self.start.0, self.size)
    }
}

impl std::fmt::Debug for TranslationBlock {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("TranslationBlock")
            .field(
                "host_range",
                &format!("{:#x}-{:#x}", self.start.0, self.start.0 + self.size),
            )
            .field("guest_pc", &format!("{:#x}", self.guest_pc))
            .finish()
    }
}

/// One interval map per region, each behind its own lock.
pub struct BlockIndex {
    start: usize,
    stride: usize,
    total_size: usize,
    splitwx_diff: isize,
    slots: Box<[Mutex<IntervalMap<Arc<TranslationBlock>>>]>,
}

impl std::fmt::Debug for BlockIndex {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("BlockIndex")
            .field("start", &RwAddr(self.start))
            .field("stride", &self.stride)
            .field("total_size", &self.total_size)
            .field("splitwx_diff", &self.splitwx_diff)
            .field("regions", &self.slots.len())
            .finish()
    }
}

impl BlockIndex {
    pub(crate) fn new(
        start: usize,
        stride: usize,
        total_size: usize,
        region_count: usize,
        splitwx_diff: isize,
    ) -> Self {
        let slots = (0..region_count)
            .map(|_| Mutex::new(IntervalMap::default()))
            .collect();
        Self {
            start,
            stride,
            total_size,
            splitwx_diff,
            slots,
        }
    }

    #[inline]
    fn in_buffer(&self, p: usize) -> bool {
        // A pointer one past the end of the buffer is valid, same as one
        // past the end of an array.
        p.wrapping_sub(self.start) <= self.total_size
    }

    /// Map an address from either W^X view to its writable-view alias.
    ///
    /// The address may come from a signal handler, so nothing about it
    /// can be assumed; `None` means it belongs to neither view.
    fn normalize(&self, p: usize) -> Option<usize> {
        if self.in_buffer(p) {
            return Some(p);
        }
        if self.splitwx_diff != 0 {
            let rw = p.wrapping_sub(self.splitwx_diff as usize);
            if self.in_buffer(rw) {
                return Some(rw);
            }
        }
        None
    }

    /// The index of the region containing `p` (either view), or `None`
    /// for an address outside the whole buffer.
    pub fn region_for(&self, p: usize) -> Option<usize> {
        let p = self.normalize(p)?;
        Some(((p - self.start) / self.stride).min(self.slots.len() - 1))
    }

    /// Index a completed translation under the region containing it.
    ///
    /// The block's span must lie within one region and not overlap any
    /// live translation; callers guarantee this by construction
    /// (translations are emitted sequentially into a region owned by one
    /// thread).
    pub fn insert(&self, tb: Arc<TranslationBlock>) {
        let idx = self
            .region_for(tb.start.0)
            .expect("translation outside the code buffer");
        log::trace!("indexing {:?} in region {}", tb, idx);
        let prev = self.slots[idx].lock().unwrap().insert(tb.span(), tb);
        debug_assert!(prev.is_none(), "translation span inserted twice");
    }

    /// Un-index an invalidated translation by its exact span.
    pub fn remove(&self, tb: &TranslationBlock) -> Option<Arc<TranslationBlock>> {
        let idx = self
            .region_for(tb.start.0)
            .expect("translation outside the code buffer");
        log::trace!("dropping {:?} from region {}", tb, idx);
        self.slots[idx].lock().unwrap().remove(&tb.span())
    }

    /// The translation whose code contains host address `p`, which may
    /// be expressed in either W^X view.
    ///
    /// Returns `None` without taking any lock when `p` maps to no
    /// region.
    pub fn lookup(&self, p: usize) -> Option<Arc<TranslationBlock>> {
        let rw = self.normalize(p)?;
        let idx = ((rw - self.start) / self.stride).min(self.slots.len() - 1);
        self.slots[idx].lock().unwrap().get_point(rw).cloned()
    }

    #[inline]
    /// [`Self::lookup`] for a program counter from the executable view.
    pub fn lookup_rx(&self, p: RxAddr) -> Option<Arc<TranslationBlock>> {
        self.lookup(p.0)
    }

    /// Visit every indexed translation, in ascending address order.
    ///
    /// Holds every region lock for the duration of the sweep.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<TranslationBlock>)) {
        let guards: Vec<_> = self.slots.iter().map(|m| m.lock().unwrap()).collect();
        for guard in &guards {
            for (_, tb) in guard.iter() {
                visit(tb);
            }
        }
    }

    /// Total number of indexed translations across all regions.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .map(|m| m.lock().unwrap().len())
            .sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every indexed translation, releasing the owned handles.
    pub fn reset_all(&self) {
        let mut guards: Vec<_> = self.slots.iter().map(|m| m.lock().unwrap()).collect();
        for guard in guards.iter_mut() {
            guard.clear();
        }
    }
}
