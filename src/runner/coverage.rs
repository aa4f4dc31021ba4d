//! Edge coverage for the fuzzer, recorded through SanitizerCoverage
//! `trace-pc-guard` callbacks into a shared bitmap.
//!
//! `.cargo/config.toml` builds with
//! `-C passes=sancov-module -C llvm-args=-sanitizer-coverage-level=3
//! -C llvm-args=-sanitizer-coverage-trace-pc-guard` to get the callbacks.
//! The fuzzer creates the region, exports its name in `SHM_ID` and reads the
//! bitmap after every execution.

use libc::c_int;
use std::alloc::{self, Layout};
use std::ffi::CString;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use thiserror::Error;

/// Size of the shared region, header included.
pub const SHM_SIZE: usize = 0x100000;
/// Number of bit slots in the bitmap.
pub const MAX_EDGES: usize = (SHM_SIZE - 4) * 8;
/// Environment variable naming the fuzzer's shared memory segment.
pub const SHM_KEY_VAR: &str = "SHM_ID";
/// Exit status for coverage faults raised inside the sanitizer callbacks.
pub const COVERAGE_EXIT_STATUS: c_int = -1;

#[repr(C)]
pub struct ShmemData {
    pub num_edges: u32,
    pub edges: [u8; 0],
}

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("Coverage instrumentation is only supported for a single module")]
    DuplicateModule,
    #[error("invalid shared memory key {0:?}")]
    InvalidKey(String),
    #[error("Failed to open shared memory region {key}: {source}")]
    Open { key: String, source: io::Error },
    #[error("Failed to mmap shared memory region {key}: {source}")]
    Map { key: String, source: io::Error },
    #[error("failed to allocate private coverage region")]
    Alloc,
}

/// A mapped coverage region. Regions are never unmapped: once handed to a
/// session they live until the process exits.
#[derive(Debug)]
pub struct CoverageRegion {
    shmem: NonNull<ShmemData>,
    key: Option<String>,
}

impl CoverageRegion {
    /// Map the region named by `SHM_ID`, or fall back to private memory.
    pub fn from_env() -> Result<Self, CoverageError> {
        let key = std::env::var(SHM_KEY_VAR).ok();
        Self::acquire(key.as_deref())
    }

    pub fn acquire(key: Option<&str>) -> Result<Self, CoverageError> {
        match key {
            Some(key) => Self::open_shared(key),
            None => {
                eprintln!("[COV] no shared memory bitmap available, skipping");
                Self::private()
            }
        }
    }

    pub fn open_shared(key: &str) -> Result<Self, CoverageError> {
        let c_key = CString::new(key).map_err(|_| CoverageError::InvalidKey(key.to_string()))?;

        let fd = unsafe {
            libc::shm_open(
                c_key.as_ptr(),
                libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(CoverageError::Open {
                key: key.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                SHM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let map_err = io::Error::last_os_error();
        // The mapping keeps the segment alive on its own.
        unsafe { libc::close(fd) };
        if addr == libc::MAP_FAILED {
            return Err(CoverageError::Map {
                key: key.to_string(),
                source: map_err,
            });
        }

        let shmem = NonNull::new(addr.cast::<ShmemData>()).ok_or(CoverageError::Alloc)?;
        Ok(Self {
            shmem,
            key: Some(key.to_string()),
        })
    }

    /// Zeroed heap memory with the same layout. Coverage is not visible to
    /// anyone else, but execution proceeds normally.
    pub fn private() -> Result<Self, CoverageError> {
        let layout = Layout::from_size_align(SHM_SIZE, 4096).map_err(|_| CoverageError::Alloc)?;
        let addr = unsafe { alloc::alloc_zeroed(layout) };
        let shmem = NonNull::new(addr.cast::<ShmemData>()).ok_or(CoverageError::Alloc)?;
        Ok(Self { shmem, key: None })
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    fn into_raw(self) -> *mut ShmemData {
        self.shmem.as_ptr()
    }
}

/// Process-wide coverage state. Only `initialize`, `reset` and `record_edge`
/// touch the guard table or the bitmap.
pub struct CoverageSession {
    initialized: AtomicBool,
    shmem: AtomicPtr<ShmemData>,
    edges_start: AtomicPtr<u32>,
    edges_stop: AtomicPtr<u32>,
    max_edges: usize,
}

static SESSION: CoverageSession = CoverageSession::new();

/// The session fed by the sanitizer callbacks.
pub fn session() -> &'static CoverageSession {
    &SESSION
}

impl CoverageSession {
    pub const fn new() -> Self {
        Self::with_max_edges(MAX_EDGES)
    }

    /// Edge indices start at 1, so at most `MAX_EDGES - 1` guards fit in the
    /// bitmap; larger caps are clamped.
    pub const fn with_max_edges(max_edges: usize) -> Self {
        let max_edges = if max_edges < MAX_EDGES {
            max_edges
        } else {
            MAX_EDGES - 1
        };
        Self {
            initialized: AtomicBool::new(false),
            shmem: AtomicPtr::new(ptr::null_mut()),
            edges_start: AtomicPtr::new(ptr::null_mut()),
            edges_stop: AtomicPtr::new(ptr::null_mut()),
            max_edges,
        }
    }

    /// Install the guard table and map the bitmap `acquire` hands back,
    /// normally [`CoverageRegion::from_env`].
    ///
    /// Returns `Ok(false)` when the call is skipped because the range is
    /// empty or its first guard is already numbered.
    ///
    /// # Safety
    /// `[start, stop)` must be a writable guard array that outlives the session.
    pub unsafe fn initialize_with<F>(
        &self,
        start: *mut u32,
        stop: *mut u32,
        acquire: F,
    ) -> Result<bool, CoverageError>
    where
        F: FnOnce() -> Result<CoverageRegion, CoverageError>,
    {
        if start == stop || unsafe { start.read() } != 0 {
            return Ok(false);
        }
        if self.initialized.load(Ordering::Acquire) {
            return Err(CoverageError::DuplicateModule);
        }

        let region = acquire()?;
        let key = region.key().unwrap_or("(private)").to_string();
        let shmem = region.into_raw();
        let num_edges = unsafe { stop.offset_from(start) } as u32;

        self.shmem.store(shmem, Ordering::Relaxed);
        self.edges_start.store(start, Ordering::Relaxed);
        self.edges_stop.store(stop, Ordering::Relaxed);
        unsafe { ptr::addr_of_mut!((*shmem).num_edges).write(num_edges) };
        self.initialized.store(true, Ordering::Release);
        self.reset();

        eprintln!("[COV] edge counters initialized. Shared memory: {key} with {num_edges} edges");
        Ok(true)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number the tracked guards `1..=n` so every edge can fire once more.
    /// Bits already set in the bitmap are left alone.
    pub fn reset(&self) {
        let Some((start, len)) = self.tracked_guards() else {
            return;
        };
        for i in 0..len {
            unsafe { start.add(i).write(i as u32 + 1) };
        }
    }

    /// Set the bit for the edge behind `guard` and disable the guard until
    /// the next reset. Guards outside the tracked window are not touched.
    ///
    /// Everything reachable from here is forced inline: the sancov pass skips
    /// `__sanitizer_*` symbols but not their callees.
    ///
    /// # Safety
    /// `guard` must come from the installed guard table.
    #[inline(always)]
    pub unsafe fn record_edge(&self, guard: *mut u32) {
        let Some((start, len)) = self.tracked_guards() else {
            return;
        };
        let (addr, base) = (guard as usize, start as usize);
        if addr < base || (addr - base) / size_of::<u32>() >= len {
            return;
        }

        let index = unsafe { guard.read() } as usize;
        if index == 0 || index >= MAX_EDGES {
            return;
        }
        let shmem = self.shmem.load(Ordering::Relaxed);
        unsafe {
            let edges = ptr::addr_of_mut!((*shmem).edges).cast::<u8>();
            *edges.add(index / 8) |= 1 << (index % 8);
            guard.write(0);
        }
    }

    pub fn num_edges(&self) -> Option<u32> {
        if !self.is_initialized() {
            return None;
        }
        let shmem = self.shmem.load(Ordering::Relaxed);
        Some(unsafe { ptr::addr_of!((*shmem).num_edges).read() })
    }

    #[cfg(test)]
    pub fn edge_is_set(&self, index: usize) -> bool {
        if !self.is_initialized() || index >= MAX_EDGES {
            return false;
        }
        let shmem = self.shmem.load(Ordering::Relaxed);
        let byte = unsafe { ptr::addr_of!((*shmem).edges).cast::<u8>().add(index / 8).read() };
        byte & (1 << (index % 8)) != 0
    }

    #[inline(always)]
    fn tracked_guards(&self) -> Option<(*mut u32, usize)> {
        if !self.initialized.load(Ordering::Acquire) {
            return None;
        }
        let start = self.edges_start.load(Ordering::Relaxed);
        let stop = self.edges_stop.load(Ordering::Relaxed);
        let len = (stop as usize - start as usize) / size_of::<u32>();
        Some((start, if len < self.max_edges { len } else { self.max_edges }))
    }
}

impl Default for CoverageSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Set while a callback runs. Instrumented code called from a callback
/// re-enters it and is ignored. Only plain loads and stores touch this flag,
/// so checking it cannot itself hit an edge. The harness is single-threaded.
static mut IN_CALLBACK: bool = false;

/// Install `[start, stop)` into `session`, ending the process on failure.
///
/// # Safety
/// Same contract as [`CoverageSession::initialize_with`].
unsafe fn initialize_or_exit<F>(session: &CoverageSession, start: *mut u32, stop: *mut u32, acquire: F)
where
    F: FnOnce() -> Result<CoverageRegion, CoverageError>,
{
    if let Err(err) = unsafe { session.initialize_with(start, stop, acquire) } {
        eprintln!("[COV] {err}");
        unsafe { libc::_exit(COVERAGE_EXIT_STATUS) };
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
    unsafe {
        let busy = &raw mut IN_CALLBACK;
        *busy = true;
        initialize_or_exit(&SESSION, start, stop, CoverageRegion::from_env);
        *busy = false;
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    unsafe {
        let busy = &raw mut IN_CALLBACK;
        if *busy {
            return;
        }
        *busy = true;
        SESSION.record_edge(guard);
        *busy = false;
    }
}
