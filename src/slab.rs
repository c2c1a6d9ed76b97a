// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the codecache project.

//! Backing store for the code buffer.
//!
//! A [`Slab`] is one contiguous range of process memory the translated
//! code lives in. Depending on host capabilities and configuration it is
//! backed by:
//!
//! - a single anonymous read-write-execute mapping,
//! - a pair of mappings of the same `memfd` pages ("split W^X"): one
//!   read-write, one read-execute, so no page is ever simultaneously
//!   writable and executable in a single view,
//! - a fixed-size buffer inside the program image (`static-buffer`
//!   feature), for hosts where requesting fresh executable mappings at
//!   runtime is unreliable,
//! - a plain read-write mapping ([`Slab::plain`]), used by tests as a
//!   fake provider; [`Slab::allocate`] never selects it.
//!
//! When split W^X is active the two views of the same physical byte are
//! related by the constant [`Slab::splitwx_diff`]. The views are kept as
//! distinct address types ([`RwAddr`], [`RxAddr`]) so they cannot be
//! conflated by accident.

use std::{ffi::c_void, ptr::NonNull};

use nix::{errno::Errno, sys::mman::ProtFlags};

bitflags::bitflags! {
    /// Protection bits achieved on the writable view of the slab.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Prot: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
/// Split execute/write preference for [`Slab::allocate`].
pub enum SplitWx {
    /// Use a single mapping that is writable and executable at once.
    Off,
    #[default]
    /// Use split W^X if the host supports it, otherwise fall back to a
    /// single read-write-execute mapping.
    Auto,
    /// Require split W^X; fail if the host cannot provide it.
    On,
}

#[derive(Copy, Clone, Ord, Eq, PartialEq, PartialOrd)]
#[repr(transparent)]
/// Address inside the writable view of the slab.
pub struct RwAddr(pub usize);

#[derive(Copy, Clone, Ord, Eq, PartialEq, PartialOrd)]
#[repr(transparent)]
/// Address inside the executable view of the slab.
///
/// Identical to the [`RwAddr`] of the same byte unless split W^X is
/// active, in which case the two differ by [`Slab::splitwx_diff`].
pub struct RxAddr(pub usize);

impl std::fmt::Display for RwAddr {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "0x{:x}", self.0)
    }
}

impl std::fmt::Debug for RwAddr {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "0x{:x}", self.0)
    }
}

impl std::fmt::Display for RxAddr {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "0x{:x}", self.0)
    }
}

impl std::fmt::Debug for RxAddr {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "0x{:x}", self.0)
    }
}

#[derive(Debug)]
pub enum SlabError {
    /// Split W^X was forced on but the host cannot provide it.
    SplitWxUnsupported { source: std::io::Error },
    /// No backing memory could be obtained at the requested size.
    Map { source: std::io::Error },
    /// Changing page protections on the obtained mapping failed.
    Protect { source: Errno },
}

impl std::fmt::Display for SlabError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::SplitWxUnsupported { source } => {
                write!(fmt, "split W^X requested but unavailable: {source}")
            }
            Self::Map { source } => write!(fmt, "could not map code buffer: {source}"),
            Self::Protect { source } => {
                write!(fmt, "could not set code buffer protection: {source}")
            }
        }
    }
}

impl std::error::Error for SlabError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SplitWxUnsupported { source } | Self::Map { source } => Some(source),
            Self::Protect { source } => Some(source),
        }
    }
}

enum SlabBacking {
    /// One anonymous mapping, read-write-execute.
    Anon(memmap2::MmapMut),
    /// Two views of the same `memfd` pages.
    #[cfg(target_os = "linux")]
    Split {
        #[allow(dead_code)]
        fd: std::os::fd::OwnedFd,
        rw: memmap2::MmapMut,
        rx: memmap2::Mmap,
    },
    /// Fixed buffer in the program image, made executable at init.
    #[cfg(feature = "static-buffer")]
    Static(NonNull<u8>),
    /// Read-write only, no execute view. Test provider.
    Plain(memmap2::MmapMut),
}

// SAFETY: the Static variant's pointer refers to a `'static` buffer that
// is handed out at most once; the mapping variants are Send + Sync
// already.
#[cfg(feature = "static-buffer")]
unsafe impl Send for SlabBacking {}
#[cfg(feature = "static-buffer")]
unsafe impl Sync for SlabBacking {}

/// The memory the code cache carves its regions out of.
pub struct Slab {
    backing: SlabBacking,
    len: usize,
    prot: Prot,
    splitwx_diff: isize,
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Slab")
            .field("base", &RwAddr(self.base()))
            .field("len", &self.len)
            .field("prot", &self.prot)
            .field("splitwx_diff", &self.splitwx_diff)
            .finish_non_exhaustive()
    }
}

impl Slab {
    /// Obtain a slab of `size` bytes per the split W^X preference.
    ///
    /// `size` must be a multiple of the host page size. A forced
    /// (`SplitWx::On`) split that the host cannot satisfy is an error;
    /// under `SplitWx::Auto` the anonymous read-write-execute mapping is
    /// used instead.
    pub fn allocate(size: usize, splitwx: SplitWx) -> Result<Self, SlabError> {
        #[cfg(feature = "static-buffer")]
        {
            match splitwx {
                SplitWx::On => {
                    return Err(SlabError::SplitWxUnsupported {
                        source: std::io::Error::from(Errno::ENOTSUP),
                    })
                }
                SplitWx::Auto | SplitWx::Off => return Self::static_buffer(size),
            }
        }
        #[cfg(not(feature = "static-buffer"))]
        match splitwx {
            SplitWx::On => Self::split(size).map_err(|source| SlabError::SplitWxUnsupported {
                source: source.into(),
            }),
            SplitWx::Auto => Self::split(size).or_else(|err| {
                log::debug!("split W^X unavailable ({err}), falling back to single mapping");
                Self::anon(size)
            }),
            SplitWx::Off => Self::anon(size),
        }
    }

    /// Single anonymous read-write-execute mapping.
    pub fn anon(size: usize) -> Result<Self, SlabError> {
        let mut map = memmap2::MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|source| SlabError::Map { source })?;
        // SAFETY: `map`'s pointer is a valid mapping of `size` bytes.
        unsafe {
            nix::sys::mman::mprotect(
                NonNull::new(map.as_mut_ptr().cast::<c_void>()).unwrap(),
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )
            .map_err(|source| SlabError::Protect { source })?;
        }
        Ok(Self {
            backing: SlabBacking::Anon(map),
            len: size,
            prot: Prot::READ | Prot::WRITE | Prot::EXEC,
            splitwx_diff: 0,
        })
    }

    #[cfg(target_os = "linux")]
    /// Two views of the same `memfd` pages: read-write and read-execute.
    pub fn split(size: usize) -> Result<Self, Errno> {
        use std::ffi::CString;

        use nix::sys::memfd;

        let fd = memfd::memfd_create(
            CString::new("codecache").unwrap().as_c_str(),
            memfd::MemFdCreateFlag::MFD_CLOEXEC,
        )?;
        nix::unistd::ftruncate(&fd, size.try_into().map_err(|_| Errno::EFBIG)?)?;
        // SAFETY: `fd` is a valid file descriptor of length `size`.
        let rw = unsafe { memmap2::MmapOptions::new().map_mut(&fd) }.map_err(io_to_errno)?;
        // SAFETY: as above; this view never becomes writable.
        let rx = unsafe { memmap2::MmapOptions::new().map_exec(&fd) }.map_err(io_to_errno)?;
        let splitwx_diff = (rx.as_ptr() as isize) - (rw.as_ptr() as isize);
        log::debug!(
            "split W^X code buffer: rw {}, rx {}, diff {:#x}",
            RwAddr(rw.as_ptr() as usize),
            RxAddr(rx.as_ptr() as usize),
            splitwx_diff,
        );
        Ok(Self {
            backing: SlabBacking::Split { fd, rw, rx },
            len: size,
            prot: Prot::READ | Prot::WRITE,
            splitwx_diff,
        })
    }

    #[cfg(not(any(target_os = "linux", feature = "static-buffer")))]
    /// Split W^X needs `memfd`; unsupported on this host.
    pub fn split(_size: usize) -> Result<Self, Errno> {
        Err(Errno::ENOTSUP)
    }

    /// Read-write mapping without an execute view.
    ///
    /// The fake memory provider for tests: region geometry, guard pages
    /// and the index behave identically, but nothing placed in the slab
    /// can be executed. Never chosen by [`Slab::allocate`].
    pub fn plain(size: usize) -> Result<Self, SlabError> {
        let map = memmap2::MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|source| SlabError::Map { source })?;
        Ok(Self {
            backing: SlabBacking::Plain(map),
            len: size,
            prot: Prot::READ | Prot::WRITE,
            splitwx_diff: 0,
        })
    }

    #[cfg(feature = "static-buffer")]
    /// The in-image buffer, clamped to its fixed capacity and made
    /// read-write-execute.
    pub fn static_buffer(size: usize) -> Result<Self, SlabError> {
        let (base, len) = static_buf::take(size).ok_or(SlabError::Map {
            source: std::io::Error::from(Errno::EBUSY),
        })?;
        // SAFETY: `base` is page-aligned and `len` a page multiple
        // within the static buffer.
        unsafe {
            nix::sys::mman::mprotect(
                base.cast::<c_void>(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )
            .map_err(|source| SlabError::Protect { source })?;
        }
        Ok(Self {
            backing: SlabBacking::Static(base),
            len,
            prot: Prot::READ | Prot::WRITE | Prot::EXEC,
            splitwx_diff: 0,
        })
    }

    #[inline]
    /// Base address of the writable view.
    pub fn base(&self) -> usize {
        match &self.backing {
            SlabBacking::Anon(map) | SlabBacking::Plain(map) => map.as_ptr() as usize,
            #[cfg(target_os = "linux")]
            SlabBacking::Split { rw, .. } => rw.as_ptr() as usize,
            #[cfg(feature = "static-buffer")]
            SlabBacking::Static(base) => base.as_ptr() as usize,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    /// Protection achieved on the writable view at allocation time.
    pub const fn prot(&self) -> Prot {
        self.prot
    }

    #[inline]
    /// Constant offset from the writable view to the executable view.
    /// Zero unless split W^X is active.
    pub const fn splitwx_diff(&self) -> isize {
        self.splitwx_diff
    }

    #[inline]
    pub const fn splitwx_enabled(&self) -> bool {
        self.splitwx_diff != 0
    }

    #[inline]
    /// Whether `p` lies in the writable view. One-past-the-end is
    /// considered inside, like a pointer just past an array.
    pub fn contains_rw(&self, p: usize) -> bool {
        p.wrapping_sub(self.base()) <= self.len
    }

    #[inline]
    /// Executable-view alias of a writable-view address.
    pub fn rw_to_rx(&self, p: RwAddr) -> RxAddr {
        debug_assert!(self.contains_rw(p.0));
        RxAddr(p.0.wrapping_add_signed(self.splitwx_diff))
    }

    #[inline]
    /// Writable-view alias of an executable-view address.
    pub fn rx_to_rw(&self, p: RxAddr) -> RwAddr {
        let rw = p.0.wrapping_sub(self.splitwx_diff as usize);
        debug_assert!(self.contains_rw(rw));
        RwAddr(rw)
    }

    /// Map an address from either view to its writable-view alias, or
    /// `None` if it belongs to neither view.
    pub fn normalize(&self, p: usize) -> Option<RwAddr> {
        if self.contains_rw(p) {
            return Some(RwAddr(p));
        }
        if self.splitwx_diff != 0 {
            let rw = p.wrapping_sub(self.splitwx_diff as usize);
            if self.contains_rw(rw) {
                return Some(RwAddr(rw));
            }
        }
        None
    }

    /// Ask the kernel to back the slab (and its executable alias) with
    /// huge pages. Advisory; failure is ignored.
    pub fn hint_hugepages(&self) {
        #[cfg(target_os = "linux")]
        match &self.backing {
            SlabBacking::Anon(map) | SlabBacking::Plain(map) => {
                _ = map.advise(memmap2::Advice::HugePage);
            }
            SlabBacking::Split { rw, rx, .. } => {
                _ = rw.advise(memmap2::Advice::HugePage);
                _ = rx.advise(memmap2::Advice::HugePage);
            }
            #[cfg(feature = "static-buffer")]
            SlabBacking::Static(_) => {}
        }
    }

    /// Set the intended protection on one region's usable range in the
    /// writable view. `exec` is false when split W^X is active (the
    /// execute bit lives only in the other view). No-op when the
    /// allocation already achieved the needed bits.
    pub fn set_region_prot(&self, start: usize, len: usize, exec: bool) -> Result<(), SlabError> {
        let mut need = Prot::READ | Prot::WRITE;
        if exec {
            need |= Prot::EXEC;
        }
        if self.prot == need {
            return Ok(());
        }
        debug_assert!(self.contains_rw(start) && self.contains_rw(start + len));
        let mut flags = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        if exec {
            flags |= ProtFlags::PROT_EXEC;
        }
        // SAFETY: `start..start + len` was bounds-checked against the
        // mapping above.
        unsafe {
            nix::sys::mman::mprotect(NonNull::new(start as *mut c_void).unwrap(), len, flags)
                .map_err(|source| SlabError::Protect { source })
        }
    }

    /// Install a no-access guard page at `addr` in the writable view.
    pub fn install_guard(&self, addr: usize, page_size: usize) -> Result<(), SlabError> {
        debug_assert!(self.contains_rw(addr) && self.contains_rw(addr + page_size));
        log::trace!("guard page at {}", RwAddr(addr));
        // SAFETY: the page was bounds-checked against the mapping above.
        unsafe {
            nix::sys::mman::mprotect(
                NonNull::new(addr as *mut c_void).unwrap(),
                page_size,
                ProtFlags::PROT_NONE,
            )
            .map_err(|source| SlabError::Protect { source })
        }
    }
}

#[cfg(target_os = "linux")]
fn io_to_errno(err: std::io::Error) -> Errno {
    err.raw_os_error().map_or(Errno::EINVAL, Errno::from_raw)
}

/// Host page size, per `sysconf(3)`.
pub fn host_page_size() -> usize {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => 4096,
    }
}

#[cfg(feature = "static-buffer")]
mod static_buf {
    use std::{
        cell::UnsafeCell,
        ptr::NonNull,
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::host_page_size;

    /// Capacity of the in-image code buffer.
    pub const STATIC_SLAB_LEN: usize = 32 * 1024 * 1024;

    #[repr(C, align(16384))]
    struct StaticSlab(UnsafeCell<[u8; STATIC_SLAB_LEN]>);

    // SAFETY: handed out at most once, through `take`.
    unsafe impl Sync for StaticSlab {}

    static SLAB: StaticSlab = StaticSlab(UnsafeCell::new([0; STATIC_SLAB_LEN]));
    static TAKEN: AtomicBool = AtomicBool::new(false);

    /// Reserve the page-aligned prefix of the buffer, at most
    /// `min(size, STATIC_SLAB_LEN)` bytes rounded down to a page
    /// multiple. Returns `None` if already taken.
    pub fn take(size: usize) -> Option<(NonNull<u8>, usize)> {
        if TAKEN.swap(true, Ordering::AcqRel) {
            return None;
        }
        let page = host_page_size();
        let base = SLAB.0.get().cast::<u8>();
        let len = (size.min(STATIC_SLAB_LEN) / page) * page;
        Some((NonNull::new(base)?, len))
    }
}
