//! Shared-Memory LRU Cache
//!
//! Hash table plus LRU list inside a shared segment, so that every process on
//! a node resolves an identical key with a single server round-trip.
//!
//! # Design
//!
//! - 1024 buckets chained through `hash_next`; all links are [`SheepPtr`]s.
//! - Entry and key share one allocation; the value is a second allocation.
//! - `result` holds either a value pointer or one of three reserved words:
//!   negative, in progress, abandoned.
//! - The first caller to find a key absent creates it in progress and becomes
//!   its owner. Everyone else waits for the owner's `update`.
//! - Allocation evicts from the LRU tail, never touching an entry that is in
//!   progress or has waiters.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::lock::{current_pid, process_alive, SegmentGuard};
use super::metrics::CacheMetrics;
use super::segment::Segment;
use super::sheep::{units_for, HeapCheck, HeapCorruption, Shared, Sheep, SheepPtr};
use crate::dircache::hash_value;
use crate::error::{Error, Result};

/// Number of buckets in the shared table
pub const NUM_BUCKETS: usize = 1024;

/// Longest key accepted (path plus kind prefix)
pub const MAX_KEY_LEN: usize = 8192;

/// Default segment size
pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Default byte budget for entries and values
pub const DEFAULT_HEAP_LIMIT: usize = 8 * 1024 * 1024;

const RESULT_NEGATIVE: u32 = 0;
const RESULT_IN_PROGRESS: u32 = u32::MAX;
const RESULT_ABANDONED: u32 = u32::MAX - 1;

/// Polls between owner liveness checks while waiting
const OWNER_CHECK_INTERVAL: u32 = 16;

// =============================================================================
// Configuration
// =============================================================================

/// Shared cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmCacheConfig {
    /// Backing file; `None` maps an anonymous segment
    pub segment_path: Option<std::path::PathBuf>,
    /// Segment size in bytes
    pub segment_size: usize,
    /// Byte budget for cached entries; 0 disables the cache
    pub heap_limit: usize,
    /// First sleep while waiting for an owner (microseconds)
    pub wait_backoff_min_us: u64,
    /// Longest sleep while waiting for an owner (microseconds)
    pub wait_backoff_max_us: u64,
}

impl Default for ShmCacheConfig {
    fn default() -> Self {
        Self {
            segment_path: None,
            segment_size: DEFAULT_SEGMENT_SIZE,
            heap_limit: DEFAULT_HEAP_LIMIT,
            wait_backoff_min_us: 10,
            wait_backoff_max_us: 10_000,
        }
    }
}

impl ShmCacheConfig {
    fn backoff(&self) -> Backoff {
        let min = Duration::from_micros(self.wait_backoff_min_us.max(1));
        let max = Duration::from_micros(self.wait_backoff_max_us).max(min);
        Backoff { next: min, max }
    }
}

/// Doubling sleep with an upper bound
struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    fn step(&mut self) -> Duration {
        let cur = self.next;
        self.next = (self.next * 2).min(self.max);
        cur
    }
}

// =============================================================================
// Shared Layout
// =============================================================================

/// Cache bookkeeping in the segment header
#[repr(C)]
#[derive(Default)]
pub struct CacheHeader {
    buckets: AtomicU32,
    lru_head: AtomicU32,
    lru_tail: AtomicU32,
    entries: AtomicU32,
    /// Bytes held by entry and value blocks
    used: AtomicU64,
    /// Byte budget for entry and value blocks
    limit: AtomicU64,
}

unsafe impl Shared for CacheHeader {}

#[repr(C)]
struct ShmEntry {
    key_len: AtomicU32,
    result: AtomicU32,
    result_len: AtomicU32,
    lru_next: AtomicU32,
    lru_prev: AtomicU32,
    hash_next: AtomicU32,
    bucket: AtomicU32,
    pending: AtomicU32,
    owner_pid: AtomicI32,
}

unsafe impl Shared for ShmEntry {}

/// Entry header size in units; the key follows it
const ENTRY_UNITS: u32 = units_for(size_of::<ShmEntry>());

fn is_value_ptr(raw: u32) -> bool {
    !matches!(raw, RESULT_NEGATIVE | RESULT_IN_PROGRESS | RESULT_ABANDONED)
}

// =============================================================================
// Public Types
// =============================================================================

/// Value stored for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    /// Cached negative answer
    Negative,
    /// An owner is resolving the key
    InProgress,
    /// The owner gave up or died; fall back to an uncached lookup
    Abandoned,
    /// Resolved value
    Resolved(String),
}

impl CachedValue {
    /// Value as an optional string, `None` for a negative answer
    pub fn as_deref(&self) -> Option<&str> {
        match self {
            CachedValue::Resolved(s) => Some(s),
            _ => None,
        }
    }
}

/// Outcome of [`ShmCache::lookup_or_add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Entry present; `InProgress` means the caller must wait
    Found(CachedValue),
    /// Entry was absent and is now in progress; the caller is the owner
    NotFound,
    /// Cache disabled
    Bypass,
}

/// Occupancy of the shared cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShmCacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub limit_bytes: usize,
    pub heap_capacity: usize,
}

/// Pending wait registered with [`ShmCache::begin_wait`]
#[derive(Debug)]
pub(crate) struct WaitTicket {
    entry: SheepPtr,
    polls: u32,
}

pub(crate) enum WaitStart {
    Ready(CachedValue),
    Pending(WaitTicket),
}

/// Wait ticket that unpins its entry when dropped
struct PinnedWait<'a> {
    cache: &'a ShmCache,
    ticket: Option<WaitTicket>,
}

impl PinnedWait<'_> {
    fn poll(&mut self) -> bool {
        match self.ticket.as_mut() {
            Some(ticket) => self.cache.poll_wait(ticket),
            None => true,
        }
    }

    fn finish(mut self) -> CachedValue {
        match self.ticket.take() {
            Some(ticket) => self.cache.finish_wait(ticket),
            None => CachedValue::Abandoned,
        }
    }
}

impl Drop for PinnedWait<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.cache.finish_wait(ticket);
        }
    }
}

// =============================================================================
// Shared Cache
// =============================================================================

/// Handle on the node's shared cache
pub struct ShmCache {
    segment: Option<Segment>,
    config: ShmCacheConfig,
    metrics: CacheMetrics,
    pid: i32,
}

impl ShmCache {
    /// Open the cache described by `config`; a zero budget yields a disabled cache
    pub fn open(config: ShmCacheConfig) -> Result<Self> {
        if config.heap_limit == 0 {
            debug!("Shared cache disabled (heap limit 0)");
            return Ok(Self::disabled());
        }

        let limit = config.heap_limit;
        let segment = match &config.segment_path {
            Some(path) => Segment::create_or_attach(path, config.segment_size, |seg| {
                format_cache(seg, limit)
            })?,
            None => Segment::anonymous(config.segment_size, |seg| format_cache(seg, limit))?,
        };

        let shared_limit = segment.header().cache.limit.load(Ordering::Relaxed) as usize;
        if shared_limit != limit {
            debug!(
                configured = limit,
                shared = shared_limit,
                "Using heap limit recorded in segment"
            );
        }

        Ok(Self {
            segment: Some(segment),
            config,
            metrics: CacheMetrics::new(),
            pid: current_pid(),
        })
    }

    /// Cache that bypasses every operation
    pub fn disabled() -> Self {
        Self {
            segment: None,
            config: ShmCacheConfig {
                heap_limit: 0,
                ..Default::default()
            },
            metrics: CacheMetrics::new(),
            pid: current_pid(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.segment.is_some()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &ShmCacheConfig {
        &self.config
    }

    fn locked(&self) -> Option<Locked<'_>> {
        let segment = self.segment.as_ref()?;
        let header = segment.header();
        let guard = header.lock.lock(self.pid);
        let heap = segment.heap();
        let cache = &header.cache;
        let buckets = heap.get_slice::<AtomicU32>(SheepPtr::load(&cache.buckets), NUM_BUCKETS);
        Some(Locked {
            heap,
            cache,
            buckets,
            metrics: &self.metrics,
            _guard: guard,
        })
    }

    fn check_key(key: &str) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::PathTooLong {
                path: key.chars().take(64).collect(),
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Look a key up, creating it in progress if absent.
    ///
    /// `NotFound` makes the caller the owner: it must finish with
    /// [`update`](Self::update) or [`abandon`](Self::abandon).
    pub fn lookup_or_add(&self, key: &str) -> Result<Lookup> {
        Self::check_key(key)?;
        let Some(tx) = self.locked() else {
            self.metrics.record_bypass();
            return Ok(Lookup::Bypass);
        };

        if let Some(entry_ptr) = tx.find(key) {
            let entry = tx.entry(entry_ptr);
            tx.promote(entry_ptr);
            match entry.result.load(Ordering::Acquire) {
                RESULT_ABANDONED => {
                    self.claim(entry);
                    self.metrics.record_reelection();
                    debug!(key, "Taking over abandoned resolution");
                    return Ok(Lookup::NotFound);
                }
                RESULT_IN_PROGRESS => {
                    let owner = entry.owner_pid.load(Ordering::Relaxed);
                    if owner != self.pid && !process_alive(owner) {
                        self.claim(entry);
                        self.metrics.record_reelection();
                        warn!(key, dead_pid = owner, "Owner died mid-resolution, taking over");
                        return Ok(Lookup::NotFound);
                    }
                    self.metrics.record_in_progress_hit();
                    return Ok(Lookup::Found(CachedValue::InProgress));
                }
                _ => {
                    self.metrics.record_hit();
                    return Ok(Lookup::Found(tx.read_value(entry)));
                }
            }
        }

        match tx.insert_entry(key) {
            Ok(entry_ptr) => {
                self.claim(tx.entry(entry_ptr));
                self.metrics.record_miss();
                self.metrics.record_owner_election();
                trace!(key, "Created in-progress entry");
                Ok(Lookup::NotFound)
            }
            Err(e) => {
                self.metrics.record_exhausted();
                Err(e)
            }
        }
    }

    fn claim(&self, entry: &ShmEntry) {
        entry.owner_pid.store(self.pid, Ordering::Relaxed);
        entry.result.store(RESULT_IN_PROGRESS, Ordering::Release);
    }

    /// Look a key up without creating it. `None` when absent or disabled.
    pub fn lookup(&self, key: &str) -> Result<Option<CachedValue>> {
        Self::check_key(key)?;
        let Some(tx) = self.locked() else {
            self.metrics.record_bypass();
            return Ok(None);
        };
        match tx.find(key) {
            Some(entry_ptr) => {
                tx.promote(entry_ptr);
                self.metrics.record_hit();
                Ok(Some(tx.read_value(tx.entry(entry_ptr))))
            }
            None => {
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    /// Owner's final write: a value, or `None` for a negative answer
    pub fn update(&self, key: &str, value: Option<&str>) -> Result<()> {
        self.store(key, value, true)
    }

    /// Insert or overwrite outside the owner/waiter protocol
    pub fn add(&self, key: &str, value: Option<&str>) -> Result<()> {
        self.store(key, value, false)
    }

    fn store(&self, key: &str, value: Option<&str>, finishing: bool) -> Result<()> {
        Self::check_key(key)?;
        let Some(tx) = self.locked() else {
            self.metrics.record_bypass();
            return Ok(());
        };

        let value_block = match value {
            Some(v) => match tx.alloc(v.len()) {
                Ok(ptr) => {
                    tx.heap.write_bytes(ptr, v.as_bytes());
                    Some((ptr, v.len() as u32))
                }
                Err(e) => {
                    self.metrics.record_exhausted();
                    if let Some(entry_ptr) = tx.find(key) {
                        let entry = tx.entry(entry_ptr);
                        if entry.result.load(Ordering::Relaxed) == RESULT_IN_PROGRESS {
                            entry.result.store(RESULT_ABANDONED, Ordering::Release);
                            self.metrics.record_abandoned();
                        }
                    }
                    warn!(key, error = %e, "No room for value, resolution abandoned");
                    return Err(e);
                }
            },
            None => None,
        };

        let entry_ptr = match tx.find(key) {
            Some(entry_ptr) => {
                let state = tx.entry(entry_ptr).result.load(Ordering::Relaxed);
                if finishing && state != RESULT_IN_PROGRESS {
                    trace!(key, "Update of an entry that was not in progress");
                }
                entry_ptr
            }
            None => match tx.insert_entry(key) {
                Ok(entry_ptr) => entry_ptr,
                Err(e) => {
                    if let Some((ptr, _)) = value_block {
                        tx.free_block(ptr);
                    }
                    self.metrics.record_exhausted();
                    return Err(e);
                }
            },
        };

        tx.set_value(entry_ptr, value_block);
        tx.promote(entry_ptr);
        Ok(())
    }

    /// Owner gives up: waiters wake with `Abandoned` and the next
    /// `lookup_or_add` elects a new owner
    pub fn abandon(&self, key: &str) -> Result<()> {
        Self::check_key(key)?;
        let Some(tx) = self.locked() else {
            return Ok(());
        };
        if let Some(entry_ptr) = tx.find(key) {
            let entry = tx.entry(entry_ptr);
            if entry.result.load(Ordering::Relaxed) == RESULT_IN_PROGRESS {
                entry.owner_pid.store(0, Ordering::Relaxed);
                entry.result.store(RESULT_ABANDONED, Ordering::Release);
                self.metrics.record_abandoned();
                debug!(key, "Resolution abandoned");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Block until the owner of `key` writes a value
    pub fn wait_for_update(&self, key: &str) -> Result<CachedValue> {
        let mut ticket = match self.begin_wait(key)? {
            WaitStart::Ready(value) => return Ok(value),
            WaitStart::Pending(ticket) => ticket,
        };
        let mut backoff = self.config.backoff();
        while !self.poll_wait(&mut ticket) {
            thread::sleep(backoff.step());
        }
        Ok(self.finish_wait(ticket))
    }

    /// Async variant of [`wait_for_update`](Self::wait_for_update)
    ///
    /// Dropping the future before it completes unpins the entry.
    pub async fn wait_for_update_async(&self, key: &str) -> Result<CachedValue> {
        let mut pinned = match self.begin_wait(key)? {
            WaitStart::Ready(value) => return Ok(value),
            WaitStart::Pending(ticket) => PinnedWait {
                cache: self,
                ticket: Some(ticket),
            },
        };
        let mut backoff = self.config.backoff();
        while !pinned.poll() {
            tokio::time::sleep(backoff.step()).await;
        }
        Ok(pinned.finish())
    }

    /// Register as a waiter. Pins the entry against eviction until `finish_wait`.
    pub(crate) fn begin_wait(&self, key: &str) -> Result<WaitStart> {
        Self::check_key(key)?;
        let Some(tx) = self.locked() else {
            return Ok(WaitStart::Ready(CachedValue::Abandoned));
        };
        let Some(entry_ptr) = tx.find(key) else {
            // Evicted before we pinned it
            return Ok(WaitStart::Ready(CachedValue::Abandoned));
        };
        let entry = tx.entry(entry_ptr);
        if entry.result.load(Ordering::Acquire) != RESULT_IN_PROGRESS {
            return Ok(WaitStart::Ready(tx.read_value(entry)));
        }
        entry.pending.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_wait();
        trace!(key, "Waiting for owner");
        Ok(WaitStart::Pending(WaitTicket {
            entry: entry_ptr,
            polls: 0,
        }))
    }

    /// Check a pending wait without the lock. True once the entry left the in-progress state.
    pub(crate) fn poll_wait(&self, ticket: &mut WaitTicket) -> bool {
        let Some(segment) = &self.segment else {
            return true;
        };
        let entry = segment.heap().get::<ShmEntry>(ticket.entry);
        if entry.result.load(Ordering::Acquire) != RESULT_IN_PROGRESS {
            return true;
        }

        ticket.polls += 1;
        if ticket.polls % OWNER_CHECK_INTERVAL == 0 {
            let owner = entry.owner_pid.load(Ordering::Relaxed);
            if owner != self.pid && !process_alive(owner) {
                let _guard = segment.header().lock.lock(self.pid);
                if entry
                    .result
                    .compare_exchange(
                        RESULT_IN_PROGRESS,
                        RESULT_ABANDONED,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.metrics.record_abandoned();
                    warn!(dead_pid = owner, "Owner died while we waited, entry abandoned");
                }
                return true;
            }
        }
        false
    }

    /// Read the final value and unpin the entry
    pub(crate) fn finish_wait(&self, ticket: WaitTicket) -> CachedValue {
        let Some(tx) = self.locked() else {
            return CachedValue::Abandoned;
        };
        let entry = tx.entry(ticket.entry);
        let value = tx.read_value(entry);
        entry.pending.fetch_sub(1, Ordering::Relaxed);
        value
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Current occupancy
    pub fn stats(&self) -> ShmCacheStats {
        let Some(segment) = &self.segment else {
            return ShmCacheStats::default();
        };
        let _guard = segment.header().lock.lock(self.pid);
        let cache = &segment.header().cache;
        ShmCacheStats {
            entries: cache.entries.load(Ordering::Relaxed) as usize,
            used_bytes: cache.used.load(Ordering::Relaxed) as usize,
            limit_bytes: cache.limit.load(Ordering::Relaxed) as usize,
            heap_capacity: segment.heap().capacity_bytes(),
        }
    }

    /// Keys and values from most to least recently used
    pub fn entries(&self) -> Vec<(String, CachedValue)> {
        let Some(tx) = self.locked() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cur = SheepPtr::load(&tx.cache.lru_head);
        while !cur.is_null() {
            let entry = tx.entry(cur);
            out.push((tx.key_of(cur), tx.read_value(entry)));
            cur = SheepPtr::load(&entry.lru_next);
        }
        out
    }

    /// Walk the segment heap and verify its structure
    pub fn check_heap(&self) -> std::result::Result<HeapCheck, HeapCorruption> {
        match self.locked() {
            Some(tx) => tx.heap.check(),
            None => Ok(HeapCheck::default()),
        }
    }
}

/// Lay out an empty cache in a freshly formatted segment
fn format_cache(segment: &Segment, limit: usize) -> Result<()> {
    let heap = segment.heap();
    let bucket_bytes = NUM_BUCKETS * size_of::<AtomicU32>();
    let buckets = heap.alloc(bucket_bytes).ok_or_else(|| Error::ShmSetup {
        path: segment
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        reason: "no room for bucket table".into(),
    })?;
    for bucket in heap.get_slice::<AtomicU32>(buckets, NUM_BUCKETS) {
        bucket.store(0, Ordering::Relaxed);
    }

    let available = heap.capacity_bytes() - heap.used_bytes();
    let cache = &segment.header().cache;
    buckets.store(&cache.buckets);
    cache.lru_head.store(0, Ordering::Relaxed);
    cache.lru_tail.store(0, Ordering::Relaxed);
    cache.entries.store(0, Ordering::Relaxed);
    cache.used.store(0, Ordering::Relaxed);
    cache.limit.store(limit.min(available) as u64, Ordering::Relaxed);
    debug!(limit = limit.min(available), available, "Formatted shared cache");
    Ok(())
}

// =============================================================================
// Locked View
// =============================================================================

/// Segment view valid while the lock is held
struct Locked<'a> {
    heap: Sheep<'a>,
    cache: &'a CacheHeader,
    buckets: &'a [AtomicU32],
    metrics: &'a CacheMetrics,
    _guard: SegmentGuard<'a>,
}

impl<'a> Locked<'a> {
    fn entry(&self, ptr: SheepPtr) -> &'a ShmEntry {
        self.heap.get::<ShmEntry>(ptr)
    }

    fn key_of(&self, ptr: SheepPtr) -> String {
        let len = self.entry(ptr).key_len.load(Ordering::Relaxed) as usize;
        String::from_utf8_lossy(&self.heap.read_bytes(ptr.add(ENTRY_UNITS), len)).into_owned()
    }

    fn bucket_of(key: &str) -> usize {
        hash_value(key) as usize % NUM_BUCKETS
    }

    fn find(&self, key: &str) -> Option<SheepPtr> {
        let mut cur = SheepPtr::load(&self.buckets[Self::bucket_of(key)]);
        while !cur.is_null() {
            let entry = self.entry(cur);
            let len = entry.key_len.load(Ordering::Relaxed) as usize;
            if len == key.len() && self.heap.read_bytes(cur.add(ENTRY_UNITS), len) == key.as_bytes() {
                return Some(cur);
            }
            cur = SheepPtr::load(&entry.hash_next);
        }
        None
    }

    fn read_value(&self, entry: &ShmEntry) -> CachedValue {
        match entry.result.load(Ordering::Acquire) {
            RESULT_NEGATIVE => CachedValue::Negative,
            RESULT_IN_PROGRESS => CachedValue::InProgress,
            RESULT_ABANDONED => CachedValue::Abandoned,
            raw => {
                let len = entry.result_len.load(Ordering::Relaxed) as usize;
                let bytes = self.heap.read_bytes(SheepPtr::from_raw(raw), len);
                CachedValue::Resolved(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Allocation under budget
    // -------------------------------------------------------------------------

    /// Allocate `bytes`, evicting from the LRU tail until the budget and heap allow it
    ///
    /// The heap may hand out a block larger than requested when the leftover is
    /// too small to split, so the budget is checked against the block it returns.
    fn alloc(&self, bytes: usize) -> Result<SheepPtr> {
        let estimate = Sheep::block_bytes_for(bytes) as u64;
        loop {
            let used = self.cache.used.load(Ordering::Relaxed);
            let limit = self.cache.limit.load(Ordering::Relaxed);
            if used + estimate <= limit {
                if let Some(ptr) = self.heap.alloc(bytes) {
                    let size = self.heap.block_size(ptr) as u64;
                    if used + size <= limit {
                        self.cache.used.fetch_add(size, Ordering::Relaxed);
                        return Ok(ptr);
                    }
                    self.heap.free(ptr);
                }
            }
            if !self.evict_one() {
                return Err(Error::CacheExhausted {
                    requested: bytes,
                    used: used as usize,
                    limit: limit as usize,
                });
            }
        }
    }

    fn free_block(&self, ptr: SheepPtr) {
        let size = self.heap.block_size(ptr) as u64;
        self.heap.free(ptr);
        self.cache.used.fetch_sub(size, Ordering::Relaxed);
    }

    /// Evict the least recently used entry nobody depends on
    fn evict_one(&self) -> bool {
        let mut cur = SheepPtr::load(&self.cache.lru_tail);
        while !cur.is_null() {
            let entry = self.entry(cur);
            let busy = entry.result.load(Ordering::Relaxed) == RESULT_IN_PROGRESS
                || entry.pending.load(Ordering::Relaxed) > 0;
            if !busy {
                trace!(key = %self.key_of(cur), "Evicting shared cache entry");
                self.remove_entry(cur);
                self.metrics.record_eviction();
                return true;
            }
            cur = SheepPtr::load(&entry.lru_prev);
        }
        false
    }

    // -------------------------------------------------------------------------
    // Entry lifecycle
    // -------------------------------------------------------------------------

    /// Create an in-progress entry at the LRU head
    fn insert_entry(&self, key: &str) -> Result<SheepPtr> {
        let ptr = self.alloc(ENTRY_UNITS as usize * super::sheep::UNIT + key.len())?;
        let entry = self.entry(ptr);
        let bucket = Self::bucket_of(key);

        entry.key_len.store(key.len() as u32, Ordering::Relaxed);
        entry.result.store(RESULT_IN_PROGRESS, Ordering::Relaxed);
        entry.result_len.store(0, Ordering::Relaxed);
        entry.pending.store(0, Ordering::Relaxed);
        entry.owner_pid.store(0, Ordering::Relaxed);
        entry.bucket.store(bucket as u32, Ordering::Relaxed);
        self.heap.write_bytes(ptr.add(ENTRY_UNITS), key.as_bytes());

        entry
            .hash_next
            .store(self.buckets[bucket].load(Ordering::Relaxed), Ordering::Relaxed);
        ptr.store(&self.buckets[bucket]);

        entry.lru_prev.store(0, Ordering::Relaxed);
        entry.lru_next.store(0, Ordering::Relaxed);
        self.push_head(ptr);
        self.cache.entries.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    /// Replace the value of an entry, freeing the previous one
    fn set_value(&self, ptr: SheepPtr, value: Option<(SheepPtr, u32)>) {
        let entry = self.entry(ptr);
        let old = entry.result.load(Ordering::Relaxed);
        if is_value_ptr(old) {
            self.free_block(SheepPtr::from_raw(old));
        }
        entry.owner_pid.store(0, Ordering::Relaxed);
        match value {
            Some((value_ptr, len)) => {
                entry.result_len.store(len, Ordering::Relaxed);
                entry.result.store(value_ptr.raw(), Ordering::Release);
            }
            None => {
                entry.result_len.store(0, Ordering::Relaxed);
                entry.result.store(RESULT_NEGATIVE, Ordering::Release);
            }
        }
    }

    fn remove_entry(&self, ptr: SheepPtr) {
        let entry = self.entry(ptr);

        let bucket = &self.buckets[entry.bucket.load(Ordering::Relaxed) as usize];
        let next = SheepPtr::load(&entry.hash_next);
        if SheepPtr::load(bucket) == ptr {
            next.store(bucket);
        } else {
            let mut cur = SheepPtr::load(bucket);
            while !cur.is_null() {
                let cur_entry = self.entry(cur);
                if SheepPtr::load(&cur_entry.hash_next) == ptr {
                    next.store(&cur_entry.hash_next);
                    break;
                }
                cur = SheepPtr::load(&cur_entry.hash_next);
            }
        }

        self.unlink_lru(ptr);
        let result = entry.result.load(Ordering::Relaxed);
        if is_value_ptr(result) {
            self.free_block(SheepPtr::from_raw(result));
        }
        self.free_block(ptr);
        self.cache.entries.fetch_sub(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // LRU list
    // -------------------------------------------------------------------------

    fn push_head(&self, ptr: SheepPtr) {
        let entry = self.entry(ptr);
        let head = SheepPtr::load(&self.cache.lru_head);
        head.store(&entry.lru_next);
        SheepPtr::NULL.store(&entry.lru_prev);
        if head.is_null() {
            ptr.store(&self.cache.lru_tail);
        } else {
            ptr.store(&self.entry(head).lru_prev);
        }
        ptr.store(&self.cache.lru_head);
    }

    fn unlink_lru(&self, ptr: SheepPtr) {
        let entry = self.entry(ptr);
        let prev = SheepPtr::load(&entry.lru_prev);
        let next = SheepPtr::load(&entry.lru_next);
        if prev.is_null() {
            next.store(&self.cache.lru_head);
        } else {
            next.store(&self.entry(prev).lru_next);
        }
        if next.is_null() {
            prev.store(&self.cache.lru_tail);
        } else {
            prev.store(&self.entry(next).lru_prev);
        }
        SheepPtr::NULL.store(&entry.lru_prev);
        SheepPtr::NULL.store(&entry.lru_next);
    }

    fn promote(&self, ptr: SheepPtr) {
        if SheepPtr::load(&self.cache.lru_head) == ptr {
            return;
        }
        self.unlink_lru(ptr);
        self.push_head(ptr);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn anon(limit: usize) -> ShmCache {
        ShmCache::open(ShmCacheConfig {
            segment_size: 256 * 1024,
            heap_limit: limit,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_first_lookup_elects_owner() {
        let cache = anon(64 * 1024);
        assert_eq!(cache.lookup_or_add("foo").unwrap(), Lookup::NotFound);
        assert_eq!(
            cache.lookup_or_add("foo").unwrap(),
            Lookup::Found(CachedValue::InProgress)
        );
        assert_eq!(cache.metrics().snapshot().owner_elections, 1);
    }

    #[test]
    fn test_update_then_lookup() {
        let cache = anon(64 * 1024);
        assert_eq!(cache.lookup_or_add("foo").unwrap(), Lookup::NotFound);
        cache.update("foo", Some("/real/path")).unwrap();
        assert_eq!(
            cache.lookup_or_add("foo").unwrap(),
            Lookup::Found(CachedValue::Resolved("/real/path".into()))
        );
    }

    #[test]
    fn test_negative_result_is_cached() {
        let cache = anon(64 * 1024);
        cache.lookup_or_add("missing").unwrap();
        cache.update("missing", None).unwrap();
        assert_eq!(
            cache.lookup_or_add("missing").unwrap(),
            Lookup::Found(CachedValue::Negative)
        );
    }

    #[test]
    fn test_update_replaces_value_without_leaking() {
        let cache = anon(64 * 1024);
        cache.add("k", Some("first value")).unwrap();
        let used = cache.stats().used_bytes;
        cache.update("k", Some("second value")).unwrap();
        assert_eq!(cache.stats().used_bytes, used);
        assert_eq!(
            cache.lookup("k").unwrap(),
            Some(CachedValue::Resolved("second value".into()))
        );
        cache.check_heap().unwrap();
    }

    #[test]
    fn test_lookup_does_not_elect() {
        let cache = anon(64 * 1024);
        assert_eq!(cache.lookup("^/nodir").unwrap(), None);
        assert_eq!(cache.stats().entries, 0);
        cache.add("^/nodir", Some("NODR")).unwrap();
        assert_eq!(
            cache.lookup("^/nodir").unwrap(),
            Some(CachedValue::Resolved("NODR".into()))
        );
    }

    #[test]
    fn test_disabled_cache_bypasses() {
        let cache = anon(0);
        assert!(!cache.is_enabled());
        assert_eq!(cache.lookup_or_add("foo").unwrap(), Lookup::Bypass);
        cache.update("foo", Some("x")).unwrap();
        assert_eq!(cache.lookup("foo").unwrap(), None);
        assert_eq!(cache.metrics().snapshot().bypassed, 3);
    }

    #[test]
    fn test_key_too_long() {
        let cache = anon(64 * 1024);
        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert_matches!(cache.lookup_or_add(&key), Err(Error::PathTooLong { .. }));
    }

    #[test]
    fn test_lru_order() {
        let cache = anon(64 * 1024);
        cache.add("a", Some("1")).unwrap();
        cache.add("b", Some("2")).unwrap();
        cache.add("c", Some("3")).unwrap();
        cache.lookup("a").unwrap();

        let keys: Vec<String> = cache.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_eviction_takes_lru_tail() {
        let cache = anon(1024);
        let mut i = 0;
        while cache.metrics().snapshot().evictions == 0 {
            cache.add(&format!("/lib/key{}", i), Some("/tmp/value")).unwrap();
            i += 1;
        }
        assert_eq!(cache.lookup("/lib/key0").unwrap(), None);
        assert!(cache.lookup(&format!("/lib/key{}", i - 1)).unwrap().is_some());
        let stats = cache.stats();
        assert!(stats.used_bytes <= stats.limit_bytes);
        cache.check_heap().unwrap();
    }

    #[test]
    fn test_eviction_skips_pending_entries() {
        let cache = anon(1024);

        // k0: resolved but a waiter has not read it yet
        assert_eq!(cache.lookup_or_add("k0").unwrap(), Lookup::NotFound);
        let ticket = match cache.begin_wait("k0").unwrap() {
            WaitStart::Pending(ticket) => ticket,
            WaitStart::Ready(v) => panic!("expected pending wait, got {:?}", v),
        };
        cache.update("k0", Some("/v0")).unwrap();
        // k1: in progress
        assert_eq!(cache.lookup_or_add("k1").unwrap(), Lookup::NotFound);

        let mut i = 2;
        while cache.metrics().snapshot().evictions == 0 {
            cache.add(&format!("k{}", i), Some("/v")).unwrap();
            i += 1;
        }
        // k2 is the oldest evictable entry
        assert_eq!(cache.lookup("k2").unwrap(), None);
        assert_eq!(
            cache.lookup("k0").unwrap(),
            Some(CachedValue::Resolved("/v0".into()))
        );
        assert_eq!(cache.lookup("k1").unwrap(), Some(CachedValue::InProgress));

        assert_eq!(
            cache.finish_wait(ticket),
            CachedValue::Resolved("/v0".into())
        );
    }

    #[test]
    fn test_exhaustion_when_everything_is_in_progress() {
        let cache = anon(1024);
        let mut created = 0;
        let err = loop {
            match cache.lookup_or_add(&format!("busy{}", created)) {
                Ok(Lookup::NotFound) => created += 1,
                Ok(other) => panic!("unexpected {:?}", other),
                Err(e) => break e,
            }
        };
        assert_matches!(err, Error::CacheExhausted { .. });
        assert!(err.is_bypassable());
        assert!(created > 0);
        assert_eq!(cache.stats().entries, created);
        assert_eq!(cache.metrics().snapshot().evictions, 0);
        assert_eq!(cache.metrics().snapshot().exhausted, 1);
    }

    #[test]
    fn test_budget_holds_when_heap_fragments() {
        let cache = anon(2048);
        let mut seed: u32 = 7;
        for i in 0..2000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let key = format!("k{}", seed % 97);
            let value = "v".repeat((seed >> 8) as usize % 72);
            cache.add(&key, Some(&value)).unwrap();
            let stats = cache.stats();
            assert!(
                stats.used_bytes <= stats.limit_bytes,
                "step {}: {} > {}",
                i,
                stats.used_bytes,
                stats.limit_bytes
            );
        }
        assert!(cache.check_heap().is_ok());
    }

    #[test]
    fn test_value_too_large_abandons_entry() {
        let cache = anon(1024);
        assert_eq!(cache.lookup_or_add("big").unwrap(), Lookup::NotFound);
        let huge = "x".repeat(4096);
        assert_matches!(
            cache.update("big", Some(&huge)),
            Err(Error::CacheExhausted { .. })
        );
        assert_eq!(cache.lookup("big").unwrap(), Some(CachedValue::Abandoned));
        // Next caller takes over
        assert_eq!(cache.lookup_or_add("big").unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_abandon_wakes_waiter_and_reelects() {
        let cache = Arc::new(anon(64 * 1024));
        assert_eq!(cache.lookup_or_add("lib").unwrap(), Lookup::NotFound);

        let waiter = {
            let cache = cache.clone();
            thread::spawn(move || cache.wait_for_update("lib").unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        cache.abandon("lib").unwrap();

        assert_eq!(waiter.join().unwrap(), CachedValue::Abandoned);
        assert_eq!(cache.lookup_or_add("lib").unwrap(), Lookup::NotFound);
        assert_eq!(cache.metrics().snapshot().reelections, 1);
    }

    #[test]
    fn test_dead_owner_is_replaced() {
        let cache = anon(64 * 1024);
        assert_eq!(cache.lookup_or_add("orphan").unwrap(), Lookup::NotFound);
        {
            let tx = cache.locked().unwrap();
            let entry = tx.entry(tx.find("orphan").unwrap());
            entry.owner_pid.store(i32::MAX, Ordering::Relaxed);
        }
        assert_eq!(cache.lookup_or_add("orphan").unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_waiter_detects_dead_owner() {
        let cache = anon(64 * 1024);
        assert_eq!(cache.lookup_or_add("orphan").unwrap(), Lookup::NotFound);
        {
            let tx = cache.locked().unwrap();
            let entry = tx.entry(tx.find("orphan").unwrap());
            entry.owner_pid.store(i32::MAX, Ordering::Relaxed);
        }
        assert_eq!(
            cache.wait_for_update("orphan").unwrap(),
            CachedValue::Abandoned
        );
    }

    #[test]
    fn test_waiter_receives_owner_value() {
        let cache = Arc::new(anon(64 * 1024));
        assert_eq!(cache.lookup_or_add("libfoo.so").unwrap(), Lookup::NotFound);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.wait_for_update("libfoo.so").unwrap())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        cache.update("libfoo.so", Some("/tmp/spindle/libfoo.so")).unwrap();

        for w in waiters {
            assert_eq!(
                w.join().unwrap(),
                CachedValue::Resolved("/tmp/spindle/libfoo.so".into())
            );
        }
    }

    #[tokio::test]
    async fn test_async_wait() {
        let cache = Arc::new(anon(64 * 1024));
        assert_eq!(cache.lookup_or_add("async").unwrap(), Lookup::NotFound);

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_for_update_async("async").await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.update("async", None).unwrap();
        assert_eq!(waiter.await.unwrap(), CachedValue::Negative);
    }

    #[tokio::test]
    async fn test_dropped_async_waiter_unpins_entry() {
        let cache = anon(1024);
        assert_eq!(cache.lookup_or_add("k0").unwrap(), Lookup::NotFound);
        let waited =
            tokio::time::timeout(Duration::from_millis(20), cache.wait_for_update_async("k0")).await;
        assert!(waited.is_err());
        cache.update("k0", Some("/v0")).unwrap();

        // Unpinned, so the entry can age out like any other
        for i in 1..200 {
            cache.add(&format!("k{}", i), Some("/filler")).unwrap();
        }
        assert_eq!(cache.lookup("k0").unwrap(), None);
    }

    #[test]
    fn test_single_owner_across_threads() {
        let cache = Arc::new(anon(64 * 1024));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.lookup_or_add("contended").unwrap())
            })
            .collect();
        let owners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|l| *l == Lookup::NotFound)
            .count();
        assert_eq!(owners, 1);
    }

    #[test]
    fn test_two_mappings_share_entries() {
        let dir = TempDir::new().unwrap();
        let config = ShmCacheConfig {
            segment_path: Some(dir.path().join("spindle.shm")),
            segment_size: 256 * 1024,
            heap_limit: 64 * 1024,
            ..Default::default()
        };
        let a = ShmCache::open(config.clone()).unwrap();
        let b = ShmCache::open(config).unwrap();

        assert_eq!(a.lookup_or_add("/usr/lib/libm.so").unwrap(), Lookup::NotFound);
        assert_eq!(
            b.lookup_or_add("/usr/lib/libm.so").unwrap(),
            Lookup::Found(CachedValue::InProgress)
        );
        a.update("/usr/lib/libm.so", Some("/tmp/libm.so")).unwrap();
        assert_eq!(
            b.wait_for_update("/usr/lib/libm.so").unwrap(),
            CachedValue::Resolved("/tmp/libm.so".into())
        );
    }
}
