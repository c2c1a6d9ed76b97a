// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

//! Region partitioning and per-thread assignment of the code buffer.
//!
//! The slab is divided into [`region_count`] equal stripes, each ending
//! in a guard page. A translator thread owns at most one region at a
//! time and emits code into it without any synchronization; when the
//! write cursor passes the region's highwater mark the thread asks the
//! [`CodeCache`] for the next free region. The only shared mutable
//! state is the partition cursor and the context registry, behind one
//! mutex whose critical sections are a cursor increment and a bounds
//! computation.
//!
//! Lock order: the partition lock is never held while taking a block
//! index lock, and vice versa ([`CodeCache::reset_all`] takes them
//! strictly one after the other).

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, OnceLock,
};

use crate::{
    blocks::{BlockIndex, TranslationBlock},
    slab::{host_page_size, Prot, RwAddr, RxAddr, Slab, SlabError, SplitWx},
};

/// Slack kept free at the end of every region so that a translation's
/// final instruction sequence never has to be split across regions.
pub const HIGHWATER_RESERVE: usize = 1024;

const MIB: usize = 1024 * 1024;
const MIN_BUFFER_SIZE: usize = MIB;
const MAX_BUFFER_SIZE: usize = 2048 * MIB;
/// Cap applied when deriving the buffer size from host memory.
const DEFAULT_BUFFER_CAP: usize = 1024 * MIB;

#[derive(Clone, Debug)]
/// Initialization parameters for [`CodeCache::new`].
pub struct CacheConfig {
    /// Requested total buffer size in bytes; `0` derives it from host
    /// physical memory, capped at a platform default. Clamped to
    /// \[1 MiB, 2 GiB\] and rounded down to a page multiple.
    pub buffer_size: usize,
    /// Split execute/write preference.
    pub splitwx: SplitWx,
    /// Expected number of concurrently translating threads; `0` is
    /// treated as `1`.
    pub max_threads: usize,
    /// Minimum bytes per region when partitioning for concurrency.
    /// A tuning default, not a correctness requirement.
    pub region_floor: usize,
    /// At most `region_multiplier * max_threads` regions.
    /// A tuning default, not a correctness requirement.
    pub region_multiplier: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            splitwx: SplitWx::default(),
            max_threads: 1,
            region_floor: 2 * MIB,
            region_multiplier: 8,
        }
    }
}

#[derive(Debug)]
pub enum CacheError {
    /// The backing store could not be obtained or protected.
    Backing(SlabError),
    /// The configuration leaves regions smaller than one usable page
    /// plus its guard.
    RegionTooSmall {
        stride: usize,
        page_size: usize,
        region_count: usize,
    },
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Backing(err) => write!(fmt, "{err}"),
            Self::RegionTooSmall {
                stride,
                page_size,
                region_count,
            } => write!(
                fmt,
                "{region_count} regions leave only {stride} bytes per region, need at least two \
                 {page_size}-byte pages each"
            ),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backing(err) => Some(err),
            Self::RegionTooSmall { .. } => None,
        }
    }
}

impl From<SlabError> for CacheError {
    fn from(err: SlabError) -> Self {
        Self::Backing(err)
    }
}

/// Choose how many regions to split a buffer of `size` bytes into.
///
/// A single thread gets a single region. Otherwise prefer more regions
/// than threads (some threads translate much more code than others),
/// each at least `floor` bytes, but no more than `multiplier` regions
/// per thread and never fewer regions than threads.
fn region_count(size: usize, max_threads: usize, floor: usize, multiplier: usize) -> usize {
    if max_threads <= 1 {
        return 1;
    }
    let n = size / floor;
    if n <= max_threads {
        max_threads
    } else {
        n.min(multiplier * max_threads)
    }
}

/// Total buffer size after applying the derivation and clamping rules.
fn buffer_size(requested: usize, page_size: usize) -> usize {
    let mut size = requested;
    if size == 0 {
        size = match host_phys_mem() {
            Some(mem) => DEFAULT_BUFFER_CAP.min(mem / 8),
            None => DEFAULT_BUFFER_CAP,
        };
    }
    align_down(size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE), page_size)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn host_phys_mem() -> Option<usize> {
    nix::sys::sysinfo::sysinfo()
        .ok()
        .map(|info| info.ram_total() as usize)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn host_phys_mem() -> Option<usize> {
    None
}

const fn align_down(x: usize, align: usize) -> usize {
    x - x % align
}

/// Stripe geometry of the partitioned slab. Immutable after
/// initialization except for [`after_prologue`], raised exactly once.
#[derive(Debug)]
struct RegionGeometry {
    /// Page-aligned base of the slab, writable view.
    start: usize,
    /// Where region 0's usable area begins once the startup prologue
    /// has been emitted into it.
    after_prologue: AtomicUsize,
    /// Number of stripes.
    n: usize,
    /// Usable bytes per stripe, excluding its guard page.
    size: usize,
    /// Distance from one stripe's start to the next.
    stride: usize,
    /// Usable bytes across the slab (excludes the trailing guard).
    total_size: usize,
}

impl RegionGeometry {
    /// Bounds of stripe `idx`'s usable range.
    ///
    /// Stripe 0 starts at `after_prologue`; the last stripe's end is the
    /// true end of the slab, absorbing the rounding remainder.
    fn bounds(&self, idx: usize) -> (usize, usize) {
        debug_assert!(idx < self.n);
        let mut start = self.start + idx * self.stride;
        let mut end = start + self.size;
        if idx == 0 {
            start = self.after_prologue.load(Ordering::Relaxed);
        }
        if idx == self.n - 1 {
            end = self.start + self.total_size;
        }
        (start, end)
    }

    /// Bytes of code the whole cache can hold.
    fn capacity(&self) -> usize {
        let guard_size = self.stride - self.size;
        self.total_size - (self.n - 1) * guard_size - self.n * HIGHWATER_RESERVE
    }
}

/// Per-thread allocation cursor into the thread's current region.
///
/// A context is owned by exactly one translator thread, which advances
/// the cursor without synchronization. The fields are relaxed atomics
/// because other threads read them, but only under the partition lock,
/// and only at safe points (reset) or for telemetry, where staleness is
/// acceptable.
#[derive(Debug, Default)]
pub struct TranslatorContext {
    buf_base: AtomicUsize,
    buf_ptr: AtomicUsize,
    buf_size: AtomicUsize,
    highwater: AtomicUsize,
}

impl TranslatorContext {
    #[inline]
    /// Base of the currently assigned region, writable view.
    pub fn base(&self) -> RwAddr {
        RwAddr(self.buf_base.load(Ordering::Relaxed))
    }

    #[inline]
    /// Current write cursor, writable view.
    pub fn write_ptr(&self) -> RwAddr {
        RwAddr(self.buf_ptr.load(Ordering::Relaxed))
    }

    #[inline]
    /// Usable size of the currently assigned region.
    pub fn buffer_size(&self) -> usize {
        self.buf_size.load(Ordering::Relaxed)
    }

    #[inline]
    /// Whether the cursor has passed the highwater mark, meaning a new
    /// region must be requested before emitting more code.
    pub fn over_highwater(&self) -> bool {
        self.buf_ptr.load(Ordering::Relaxed) > self.highwater.load(Ordering::Relaxed)
    }

    /// Claim `len` bytes at the write cursor, returning their start.
    ///
    /// Only the owning thread may call this. Overrunning the highwater
    /// mark is allowed (the reserve exists for exactly that); the guard
    /// page bounds any true overrun.
    pub fn advance(&self, len: usize) -> RwAddr {
        let start = self.buf_ptr.load(Ordering::Relaxed);
        self.buf_ptr.store(start + len, Ordering::Relaxed);
        RwAddr(start)
    }

    #[inline]
    fn used(&self) -> usize {
        self.buf_ptr.load(Ordering::Relaxed) - self.buf_base.load(Ordering::Relaxed)
    }

    fn assign(&self, start: usize, end: usize) {
        self.buf_base.store(start, Ordering::Relaxed);
        self.buf_ptr.store(start, Ordering::Relaxed);
        self.buf_size.store(end - start, Ordering::Relaxed);
        self.highwater
            .store(end - HIGHWATER_RESERVE, Ordering::Relaxed);
    }
}

/// Partition cursor and context registry; all behind one mutex.
#[derive(Debug, Default)]
struct Partition {
    /// Next unassigned stripe; `== n` means exhausted until reset.
    current: usize,
    /// Bytes used by regions handed back since the last reset.
    agg_flushed_bytes: usize,
    contexts: Vec<Arc<TranslatorContext>>,
}

/// The code cache: slab, stripe geometry, translation index and the
/// region assignment protocol.
#[derive(Debug)]
pub struct CodeCache {
    slab: Slab,
    geometry: RegionGeometry,
    index: BlockIndex,
    partition: Mutex<Partition>,
    prologue_tail: OnceLock<(RxAddr, usize)>,
}

impl CodeCache {
    /// Allocate the backing store per `config` and partition it.
    ///
    /// Must be called before any translator thread starts emitting
    /// code. All failures are fatal to startup: the caller is expected
    /// to abort rather than run without a code cache.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let size = buffer_size(config.buffer_size, host_page_size());
        let slab = Slab::allocate(size, config.splitwx)?;
        Self::with_slab(slab, config)
    }

    /// Partition an already-obtained slab.
    ///
    /// This is also the seam for tests, which pass a [`Slab::plain`]
    /// fake so that no executable mappings are required.
    pub fn with_slab(slab: Slab, config: &CacheConfig) -> Result<Self, CacheError> {
        let page_size = host_page_size();
        let size = align_down(slab.len(), page_size);
        slab.hint_hugepages();

        let n = region_count(
            size,
            config.max_threads.max(1),
            config.region_floor.max(page_size),
            config.region_multiplier.max(1),
        );
        let stride = align_down(size / n, page_size);
        if stride < 2 * page_size {
            return Err(CacheError::RegionTooSmall {
                stride,
                page_size,
                region_count: n,
            });
        }
        let geometry = RegionGeometry {
            start: slab.base(),
            after_prologue: AtomicUsize::new(slab.base()),
            n,
            size: stride - page_size,
            stride,
            total_size: size - page_size,
        };

        // The execute bit belongs in the writable view only when there
        // is a single view.
        let exec = !slab.splitwx_enabled() && slab.prot().contains(Prot::EXEC);
        for idx in 0..n {
            let (start, end) = geometry.bounds(idx);
            slab.set_region_prot(start, end - start, exec)?;
            slab.install_guard(end, page_size)?;
        }

        let index = BlockIndex::new(slab.base(), stride, geometry.total_size, n, slab.splitwx_diff());
        log::info!(
            "code cache at {}: {} regions of {} usable bytes, split W^X {}",
            RwAddr(slab.base()),
            n,
            geometry.size,
            if slab.splitwx_enabled() { "on" } else { "off" },
        );
        Ok(Self {
            slab,
            geometry,
            index,
            partition: Mutex::new(Partition::default()),
            prologue_tail: OnceLock::new(),
        })
    }

    /// Register a translator thread's context and hand it its first
    /// region. Aborts if no region is left: callers size `max_threads`
    /// so that every expected thread can be seated, and registration
    /// failing is a programming error, not a runtime condition.
    pub fn register_context(&self) -> Arc<TranslatorContext> {
        let ctx = Arc::new(TranslatorContext::default());
        let mut part = self.partition.lock().unwrap();
        part.contexts.push(Arc::clone(&ctx));
        let out_of_space = self.alloc_locked(&mut part, &ctx);
        assert!(
            !out_of_space,
            "no region left for a newly registered translator context"
        );
        ctx
    }

    fn alloc_locked(&self, part: &mut Partition, ctx: &TranslatorContext) -> bool {
        if part.current == self.geometry.n {
            return true;
        }
        let (start, end) = self.geometry.bounds(part.current);
        ctx.assign(start, end);
        log::trace!(
            "region {} ({}..{}) assigned",
            part.current,
            RwAddr(start),
            RwAddr(end),
        );
        part.current += 1;
        false
    }

    #[must_use = "out-of-space must trigger a cache flush or abort the translation"]
    /// Hand `ctx` the next free region once its current one has filled
    /// up. Returns `true` when every region has been handed out; the
    /// caller then flushes the whole cache ([`Self::reset_all`], at a
    /// safe point) and retries, or abandons the current translation.
    pub fn alloc_region(&self, ctx: &TranslatorContext) -> bool {
        // The region being vacated counts as fully used from here on;
        // read its size before it is overwritten.
        let size_full = ctx.buffer_size();
        let mut part = self.partition.lock().unwrap();
        let out_of_space = self.alloc_locked(&mut part, ctx);
        if !out_of_space {
            part.agg_flushed_bytes += size_full.saturating_sub(HIGHWATER_RESERVE);
        }
        out_of_space
    }

    /// Reclaim every region and clear the translation index.
    ///
    /// Every registered context is re-seated starting from region 0.
    /// The caller must guarantee a safe point: no thread may be
    /// emitting code or holding a handle into the index across this
    /// call.
    pub fn reset_all(&self) {
        {
            let mut part = self.partition.lock().unwrap();
            part.current = 0;
            part.agg_flushed_bytes = 0;
            for idx in 0..part.contexts.len() {
                let ctx = Arc::clone(&part.contexts[idx]);
                let out_of_space = self.alloc_locked(&mut part, &ctx);
                assert!(!out_of_space, "fewer regions than registered contexts");
            }
        }
        self.index.reset_all();
        log::debug!("code cache flushed");
    }

    /// Record that the startup prologue has been emitted into region 0
    /// by `ctx`, permanently shrinking region 0's usable range to start
    /// after it.
    ///
    /// Must be called exactly once, before any other thread registers,
    /// and only by the context that was handed region 0 from the true
    /// base of the slab.
    pub fn prologue_installed(&self, ctx: &TranslatorContext) {
        assert_eq!(
            ctx.base().0,
            self.geometry.start,
            "prologue must be emitted at the base of region 0"
        );
        let after = ctx.write_ptr().0;
        assert!(after > self.geometry.start, "empty prologue");
        self.geometry.after_prologue.store(after, Ordering::Relaxed);

        // Re-seat the context on region 0's shrunk bounds.
        let (start, end) = self.geometry.bounds(0);
        ctx.assign(start, end);

        // The balance of the buffer is what a JIT debugger wants to
        // know about; record it for the embedder to report.
        let tail_len = self.geometry.start + self.geometry.total_size - after;
        let tail = self.slab.rw_to_rx(RwAddr(after));
        let installed = self.prologue_tail.set((tail, tail_len)).is_ok();
        assert!(installed, "prologue installed twice");
        log::debug!("prologue tail at {tail}, {tail_len} bytes");
    }

    #[inline]
    /// Executable-view range of the buffer past the prologue, for JIT
    /// debugger registration. `None` until [`Self::prologue_installed`].
    pub fn prologue_tail(&self) -> Option<(RxAddr, usize)> {
        self.prologue_tail.get().copied()
    }

    /// Bytes of code currently in the cache, across flushed-but-not-yet
    /// -reclaimed regions and every context's live region.
    pub fn code_size(&self) -> usize {
        let part = self.partition.lock().unwrap();
        let mut total = part.agg_flushed_bytes;
        for ctx in &part.contexts {
            let used = ctx.used();
            assert!(
                used <= ctx.buffer_size(),
                "context write cursor left its buffer"
            );
            total += used;
        }
        total
    }

    #[inline]
    /// Bytes of code the cache can hold in total.
    ///
    /// Pure function of the partition geometry; needs no
    /// synchronization once initialization has completed.
    pub fn code_capacity(&self) -> usize {
        self.geometry.capacity()
    }

    #[inline]
    pub fn region_count(&self) -> usize {
        self.geometry.n
    }

    /// Usable bounds of region `idx`, writable view.
    pub fn region_bounds(&self, idx: usize) -> (RwAddr, RwAddr) {
        let (start, end) = self.geometry.bounds(idx);
        (RwAddr(start), RwAddr(end))
    }

    #[inline]
    pub const fn slab(&self) -> &Slab {
        &self.slab
    }

    // Translation index entry points.

    #[inline]
    /// Index a completed translation.
    pub fn tb_insert(&self, tb: Arc<TranslationBlock>) {
        self.index.insert(tb);
    }

    #[inline]
    /// Un-index an individually invalidated translation.
    pub fn tb_remove(&self, tb: &TranslationBlock) -> Option<Arc<TranslationBlock>> {
        self.index.remove(tb)
    }

    #[inline]
    /// The translation containing host address `p` (either W^X view).
    pub fn tb_lookup(&self, p: usize) -> Option<Arc<TranslationBlock>> {
        self.index.lookup(p)
    }

    #[inline]
    /// Visit every live translation, ascending by address.
    pub fn tb_foreach(&self, visit: impl FnMut(&Arc<TranslationBlock>)) {
        self.index.for_each(visit);
    }

    #[inline]
    /// Number of live translations.
    pub fn tb_count(&self) -> usize {
        self.index.len()
    }
}
