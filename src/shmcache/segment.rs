//! Shared Segment
//!
//! Memory mapping that holds the shared cache. Either file-backed, so that
//! unrelated processes on a node can attach to it, or anonymous for a single
//! process tree.
//!
//! # Layout
//!
//! ```text
//! offset 0    SegmentHeader { magic, version, state, size, lock, heap, cache }
//! heap_start  sheep heap (bucket array, entries, values)
//! ```
//!
//! Exactly one process initialises a file-backed segment: the one whose
//! exclusive create of the backing file succeeds. Everyone else waits for
//! `state == READY`.

use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use super::cache::CacheHeader;
use super::lock::LockWord;
use super::sheep::{HeapHeader, Shared, Sheep, UNIT};
use crate::error::{Error, Result};

/// "SPINDLE\0"
const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"SPINDLE\0");
const SEGMENT_VERSION: u32 = 1;

const STATE_NEW: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;
const STATE_FAILED: u32 = 3;

/// Smallest usable segment
pub const MIN_SEGMENT_SIZE: usize = 64 * 1024;

/// Largest segment accepted; unit offsets and block sizes must fit in 31 bits
pub const MAX_SEGMENT_SIZE: usize = 1024 * 1024 * 1024;

/// How long an attaching process waits for the creator to finish
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed header at offset 0 of every segment
#[repr(C)]
pub struct SegmentHeader {
    magic: AtomicU64,
    version: AtomicU32,
    state: AtomicU32,
    size: AtomicU64,
    pub lock: LockWord,
    pub heap: HeapHeader,
    pub cache: CacheHeader,
}

unsafe impl Shared for SegmentHeader {}

/// Byte offset of the first heap block
pub const HEAP_START: usize = size_of::<SegmentHeader>().div_ceil(UNIT) * UNIT;

/// A mapped segment
pub struct Segment {
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
    path: Option<PathBuf>,
}

// SAFETY: the mapping is only reached through atomics or under the segment lock.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Map a private anonymous segment and initialise it
    pub fn anonymous<F>(size: usize, init: F) -> Result<Self>
    where
        F: FnOnce(&Segment) -> Result<()>,
    {
        check_size("<anonymous>", size)?;
        let map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|e| setup_error("<anonymous>", e))?;
        let segment = Self::from_map(map, None)?;
        segment.initialize(init)?;
        Ok(segment)
    }

    /// Create the segment file at `path`, or attach to it if it already exists.
    /// `init` runs only in the creating process.
    pub fn create_or_attach<F>(path: impl AsRef<Path>, size: usize, init: F) -> Result<Self>
    where
        F: FnOnce(&Segment) -> Result<()>,
    {
        let path = path.as_ref();
        let shown = path.display().to_string();
        check_size(&shown, size)?;

        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => {
                file.set_len(size as u64)?;
                // SAFETY: file is open read/write; concurrent users go through atomics.
                let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
                    .map_err(|e| setup_error(&shown, e))?;
                let segment = Self::from_map(map, Some(path.to_path_buf()))?;
                segment.initialize(init)?;
                info!(path = %shown, size, "Created shared cache segment");
                Ok(segment)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Self::attach(path),
            Err(e) => Err(setup_error(&shown, e)),
        }
    }

    /// Attach to an existing, initialised segment file
    pub fn attach(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let deadline = Instant::now() + INIT_TIMEOUT;

        // The creator sizes the file right after creating it
        let len = loop {
            let len = file.metadata()?.len() as usize;
            if len >= HEAP_START {
                break len;
            }
            if Instant::now() >= deadline {
                return Err(Error::ShmSetup {
                    path: shown,
                    reason: format!("segment file too small ({} bytes)", len),
                });
            }
            thread::sleep(Duration::from_millis(1));
        };

        // SAFETY: as in `create_or_attach`.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| setup_error(&shown, e))?;
        let segment = Self::from_map(map, Some(path.to_path_buf()))?;

        let header = segment.header();
        loop {
            match header.state.load(Ordering::Acquire) {
                STATE_READY => break,
                STATE_FAILED => {
                    return Err(Error::ShmSetup {
                        path: shown,
                        reason: "creator failed to initialise segment".into(),
                    })
                }
                state if state > STATE_FAILED => {
                    return Err(Error::ShmSetup {
                        path: shown,
                        reason: format!("unknown segment state {:#x}", state),
                    })
                }
                _ if Instant::now() >= deadline => {
                    return Err(Error::ShmSetup {
                        path: shown,
                        reason: "timed out waiting for segment initialisation".into(),
                    })
                }
                _ => thread::sleep(Duration::from_millis(1)),
            }
        }

        if header.magic.load(Ordering::Relaxed) != SEGMENT_MAGIC {
            return Err(Error::ShmSetup {
                path: shown,
                reason: "bad magic".into(),
            });
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != SEGMENT_VERSION {
            return Err(Error::ShmSetup {
                path: shown,
                reason: format!("version {} not supported (expected {})", version, SEGMENT_VERSION),
            });
        }

        debug!(path = %shown, len, "Attached to shared cache segment");
        Ok(segment)
    }

    fn from_map(mut map: MmapMut, path: Option<PathBuf>) -> Result<Self> {
        let len = map.len();
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| {
            Error::Internal("mapping returned a null address".into())
        })?;
        Ok(Self {
            _map: map,
            base,
            len,
            path,
        })
    }

    fn initialize<F>(&self, init: F) -> Result<()>
    where
        F: FnOnce(&Segment) -> Result<()>,
    {
        let header = self.header();
        if header
            .state
            .compare_exchange(STATE_NEW, STATE_INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ShmSetup {
                path: self.describe(),
                reason: "segment already initialised".into(),
            });
        }

        header.magic.store(SEGMENT_MAGIC, Ordering::Relaxed);
        header.version.store(SEGMENT_VERSION, Ordering::Relaxed);
        header.size.store(self.len as u64, Ordering::Relaxed);
        self.heap().format(HEAP_START, self.len);

        match init(self) {
            Ok(()) => {
                header.state.store(STATE_READY, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                header.state.store(STATE_FAILED, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Header at offset 0
    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is at least HEAP_START bytes, page aligned, and
        // SegmentHeader is all atomics.
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    /// Allocator view over the segment heap
    pub fn heap(&self) -> Sheep<'_> {
        // SAFETY: base/len describe the live mapping owned by self.
        unsafe { Sheep::new(self.base, self.len, &self.header().heap) }
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing file, for file-backed segments
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn describe(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<anonymous>".to_string())
    }
}

fn check_size(path: &str, size: usize) -> Result<()> {
    if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&size) {
        return Err(Error::ShmSetup {
            path: path.to_string(),
            reason: format!(
                "segment size {} outside [{}, {}]",
                size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            ),
        });
    }
    Ok(())
}

fn setup_error(path: &str, e: std::io::Error) -> Error {
    Error::ShmSetup {
        path: path.to_string(),
        reason: e.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
