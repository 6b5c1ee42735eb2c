//! Sheep: Relative-Pointer Arena Allocator
//!
//! Best-fit free-list allocator over a memory region that may be mapped at a
//! different address in every process attached to it.
//!
//! # Design
//!
//! - Every reference is a [`SheepPtr`]: an offset from the region base in
//!   8-byte units. Offset 0 is the null pointer (the region always starts
//!   with a header, so no allocation can live there).
//! - Each block starts with a [`BlockHeader`] holding its size, the offset of
//!   the physically preceding block, and free-list links.
//! - Freeing coalesces with both physical neighbours, so two free blocks are
//!   never adjacent.
//! - All header words are atomics; callers serialize mutation with the
//!   segment lock and the atomics only make cross-process access well-defined.
//!
//! ```text
//! | BlockHeader (16B) | payload ... | BlockHeader | payload ... |
//!   size|ALLOC_BIT      ^ SheepPtr
//!   prev_block
//!   next_free/prev_free
//! ```

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Size of one allocation unit in bytes
pub const UNIT: usize = 8;

/// Allocated flag in `BlockHeader::size`
const ALLOC_BIT: u32 = 1 << 31;

/// Header size in units
const HEADER_UNITS: u32 = (size_of::<BlockHeader>() / UNIT) as u32;

/// Smallest block worth splitting off: header plus one payload unit
const MIN_BLOCK_UNITS: u32 = HEADER_UNITS + 1;

/// Segment-relative pointer in 8-byte units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct SheepPtr(u32);

impl SheepPtr {
    pub const NULL: SheepPtr = SheepPtr(0);

    pub const fn from_raw(raw: u32) -> Self {
        SheepPtr(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte offset from the region base
    pub const fn byte_offset(self) -> usize {
        self.0 as usize * UNIT
    }

    /// Pointer `units` further into the region
    pub const fn add(self, units: u32) -> Self {
        SheepPtr(self.0 + units)
    }

    /// Pointer to the first unit at or after `bytes`
    pub const fn from_byte_offset(bytes: usize) -> Self {
        SheepPtr(bytes.div_ceil(UNIT) as u32)
    }

    pub(crate) fn load(cell: &AtomicU32) -> Self {
        SheepPtr(cell.load(Ordering::Relaxed))
    }

    pub(crate) fn store(self, cell: &AtomicU32) {
        cell.store(self.0, Ordering::Relaxed);
    }
}

/// Number of units needed to hold `bytes`
#[inline]
pub const fn units_for(bytes: usize) -> u32 {
    bytes.div_ceil(UNIT) as u32
}

/// Marker for types that may be viewed in place inside a shared region.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain only atomics, and be valid for
/// any bit pattern (all zero included).
pub unsafe trait Shared {}

unsafe impl Shared for AtomicU32 {}
unsafe impl Shared for AtomicI32 {}
unsafe impl Shared for AtomicU64 {}

/// Per-block bookkeeping placed in front of every payload
#[repr(C)]
#[derive(Default)]
pub struct BlockHeader {
    /// Block size in units, header included, with `ALLOC_BIT`
    size: AtomicU32,
    /// Physically preceding block, or null for the first block
    prev_block: AtomicU32,
    next_free: AtomicU32,
    prev_free: AtomicU32,
}

unsafe impl Shared for BlockHeader {}

impl BlockHeader {
    fn units(&self) -> u32 {
        self.size.load(Ordering::Relaxed) & !ALLOC_BIT
    }

    fn is_allocated(&self) -> bool {
        self.size.load(Ordering::Relaxed) & ALLOC_BIT != 0
    }

    fn set(&self, units: u32, allocated: bool) {
        let flag = if allocated { ALLOC_BIT } else { 0 };
        self.size.store(units | flag, Ordering::Relaxed);
    }
}

/// Heap-wide bookkeeping, stored inside the region it manages
#[repr(C)]
#[derive(Default)]
pub struct HeapHeader {
    /// First block
    start: AtomicU32,
    /// One past the last unit of the heap
    end: AtomicU32,
    /// Head of the free list
    free_head: AtomicU32,
    /// Units held by allocated blocks, headers included
    used: AtomicU32,
}

unsafe impl Shared for HeapHeader {}

/// Result of walking the heap block by block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapCheck {
    pub blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

/// Errors found by [`Sheep::check`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapCorruption {
    #[error("block at unit {0} has size zero")]
    ZeroSizedBlock(u32),
    #[error("block at unit {0} runs past the heap end")]
    Overrun(u32),
    #[error("block at unit {at} records prev_block {recorded}, expected {expected}")]
    BrokenBackLink { at: u32, recorded: u32, expected: u32 },
    #[error("adjacent free blocks at units {0} and {1}")]
    Uncoalesced(u32, u32),
    #[error("free list has {listed} blocks, heap walk found {walked}")]
    FreeListMismatch { listed: usize, walked: usize },
    #[error("used counter is {counter} units, heap walk found {walked}")]
    UsedMismatch { counter: u32, walked: u32 },
}

/// Allocator view over a region. Cheap to construct; build one per operation.
#[derive(Clone, Copy)]
pub struct Sheep<'a> {
    base: NonNull<u8>,
    len: usize,
    header: &'a HeapHeader,
    _region: PhantomData<&'a [AtomicU32]>,
}

impl<'a> Sheep<'a> {
    /// View the region at `base` whose heap bookkeeping lives in `header`.
    ///
    /// # Safety
    ///
    /// `base` must be 8-byte aligned and valid for reads and writes of `len`
    /// bytes for `'a`. All accesses to the region by other views must go
    /// through atomics or be serialized with this one.
    pub unsafe fn new(base: NonNull<u8>, len: usize, header: &'a HeapHeader) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % UNIT, 0);
        Self {
            base,
            len,
            header,
            _region: PhantomData,
        }
    }

    /// Lay out a fresh heap covering bytes `[start, end)` as one free block
    pub fn format(&self, start: usize, end: usize) {
        let start = SheepPtr::from_byte_offset(start.max(UNIT));
        let end = SheepPtr((end.min(self.len) / UNIT) as u32);
        assert!(
            end.0 >= start.0 + MIN_BLOCK_UNITS,
            "heap region too small"
        );

        let block = self.block(start);
        block.set(end.0 - start.0, false);
        block.prev_block.store(0, Ordering::Relaxed);
        block.next_free.store(0, Ordering::Relaxed);
        block.prev_free.store(0, Ordering::Relaxed);

        self.header.start.store(start.0, Ordering::Relaxed);
        self.header.end.store(end.0, Ordering::Relaxed);
        self.header.free_head.store(start.0, Ordering::Relaxed);
        self.header.used.store(0, Ordering::Relaxed);
    }

    /// Bytes held by allocated blocks, headers included
    pub fn used_bytes(&self) -> usize {
        self.header.used.load(Ordering::Relaxed) as usize * UNIT
    }

    /// Total bytes the heap manages
    pub fn capacity_bytes(&self) -> usize {
        let start = self.header.start.load(Ordering::Relaxed);
        let end = self.header.end.load(Ordering::Relaxed);
        (end - start) as usize * UNIT
    }

    /// Bytes a block serving a `bytes` request occupies, header included
    pub const fn block_bytes_for(bytes: usize) -> usize {
        (HEADER_UNITS + units_for_payload(bytes)) as usize * UNIT
    }

    // =========================================================================
    // Translation
    // =========================================================================

    fn in_bounds(&self, ptr: SheepPtr, bytes: usize) -> bool {
        !ptr.is_null() && ptr.byte_offset().checked_add(bytes).is_some_and(|e| e <= self.len)
    }

    /// View a `T` stored at `ptr`
    pub fn get<T: Shared>(&self, ptr: SheepPtr) -> &'a T {
        assert!(align_of::<T>() <= UNIT);
        assert!(
            self.in_bounds(ptr, size_of::<T>()),
            "sheep pointer {} out of bounds",
            ptr.0
        );
        // SAFETY: bounds and alignment checked; T is all-atomic and valid for any bits.
        unsafe { &*(self.base.as_ptr().add(ptr.byte_offset()) as *const T) }
    }

    /// View `count` consecutive `T` stored at `ptr`
    pub fn get_slice<T: Shared>(&self, ptr: SheepPtr, count: usize) -> &'a [T] {
        assert!(align_of::<T>() <= UNIT);
        assert!(
            self.in_bounds(ptr, size_of::<T>() * count),
            "sheep slice {} out of bounds",
            ptr.0
        );
        // SAFETY: as for `get`.
        unsafe {
            std::slice::from_raw_parts(
                self.base.as_ptr().add(ptr.byte_offset()) as *const T,
                count,
            )
        }
    }

    /// Copy `len` bytes out of the region
    pub fn read_bytes(&self, ptr: SheepPtr, len: usize) -> Vec<u8> {
        assert!(self.in_bounds(ptr, len), "sheep read {} out of bounds", ptr.0);
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked; writers are serialized by the segment lock.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(ptr.byte_offset()),
                out.as_mut_ptr(),
                len,
            );
        }
        out
    }

    /// Copy `data` into the region
    pub fn write_bytes(&self, ptr: SheepPtr, data: &[u8]) {
        assert!(
            self.in_bounds(ptr, data.len()),
            "sheep write {} out of bounds",
            ptr.0
        );
        // SAFETY: bounds checked; writers are serialized by the segment lock.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(ptr.byte_offset()),
                data.len(),
            );
        }
    }

    fn block(&self, at: SheepPtr) -> &'a BlockHeader {
        self.get::<BlockHeader>(at)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate at least `bytes` of payload. Returns `None` when no free block fits.
    pub fn alloc(&self, bytes: usize) -> Option<SheepPtr> {
        let need = HEADER_UNITS + units_for_payload(bytes);

        // Best fit over the free list
        let mut best: Option<(SheepPtr, u32)> = None;
        let mut cur = SheepPtr::load(&self.header.free_head);
        while !cur.is_null() {
            let block = self.block(cur);
            let units = block.units();
            if units >= need && best.map_or(true, |(_, b)| units < b) {
                best = Some((cur, units));
                if units == need {
                    break;
                }
            }
            cur = SheepPtr::load(&block.next_free);
        }

        let (at, units) = best?;
        self.unlink_free(at);

        let block = self.block(at);
        if units - need >= MIN_BLOCK_UNITS {
            let rest = at.add(need);
            let rest_block = self.block(rest);
            rest_block.set(units - need, false);
            rest_block.prev_block.store(at.0, Ordering::Relaxed);
            self.set_prev_of_next(rest, units - need);
            self.push_free(rest);
            block.set(need, true);
        } else {
            block.set(units, true);
        }

        self.header
            .used
            .fetch_add(block.units(), Ordering::Relaxed);
        Some(at.add(HEADER_UNITS))
    }

    /// Return a block to the heap, merging it with free neighbours
    pub fn free(&self, ptr: SheepPtr) {
        if ptr.is_null() {
            return;
        }
        let mut at = SheepPtr(ptr.0 - HEADER_UNITS);
        let block = self.block(at);
        assert!(block.is_allocated(), "double free of sheep block {}", at.0);

        let mut units = block.units();
        self.header.used.fetch_sub(units, Ordering::Relaxed);

        let end = self.header.end.load(Ordering::Relaxed);
        let next = at.add(units);
        if next.0 < end {
            let next_block = self.block(next);
            if !next_block.is_allocated() {
                self.unlink_free(next);
                units += next_block.units();
            }
        }

        let prev = SheepPtr::load(&block.prev_block);
        if !prev.is_null() {
            let prev_block = self.block(prev);
            if !prev_block.is_allocated() {
                self.unlink_free(prev);
                units += prev_block.units();
                at = prev;
            }
        }

        self.block(at).set(units, false);
        self.set_prev_of_next(at, units);
        self.push_free(at);
    }

    /// Usable payload bytes of an allocation
    pub fn alloc_size(&self, ptr: SheepPtr) -> usize {
        let block = self.block(SheepPtr(ptr.0 - HEADER_UNITS));
        (block.units() - HEADER_UNITS) as usize * UNIT
    }

    /// Bytes of the block behind an allocation, header included
    pub fn block_size(&self, ptr: SheepPtr) -> usize {
        self.block(SheepPtr(ptr.0 - HEADER_UNITS)).units() as usize * UNIT
    }

    fn set_prev_of_next(&self, at: SheepPtr, units: u32) {
        let next = at.add(units);
        if next.0 < self.header.end.load(Ordering::Relaxed) {
            self.block(next).prev_block.store(at.0, Ordering::Relaxed);
        }
    }

    fn push_free(&self, at: SheepPtr) {
        let block = self.block(at);
        let head = SheepPtr::load(&self.header.free_head);
        block.next_free.store(head.0, Ordering::Relaxed);
        block.prev_free.store(0, Ordering::Relaxed);
        if !head.is_null() {
            self.block(head).prev_free.store(at.0, Ordering::Relaxed);
        }
        at.store(&self.header.free_head);
    }

    fn unlink_free(&self, at: SheepPtr) {
        let block = self.block(at);
        let next = SheepPtr::load(&block.next_free);
        let prev = SheepPtr::load(&block.prev_free);
        if prev.is_null() {
            next.store(&self.header.free_head);
        } else {
            next.store(&self.block(prev).next_free);
        }
        if !next.is_null() {
            prev.store(&self.block(next).prev_free);
        }
        block.next_free.store(0, Ordering::Relaxed);
        block.prev_free.store(0, Ordering::Relaxed);
    }

    // =========================================================================
    // Integrity
    // =========================================================================

    /// Walk every block and cross-check the free list and usage counter
    pub fn check(&self) -> Result<HeapCheck, HeapCorruption> {
        let start = self.header.start.load(Ordering::Relaxed);
        let end = self.header.end.load(Ordering::Relaxed);
        let mut report = HeapCheck::default();
        let mut used_units = 0u32;

        let mut at = start;
        let mut prev = 0u32;
        let mut prev_free = false;
        while at < end {
            let block = self.block(SheepPtr(at));
            let units = block.units();
            if units == 0 {
                return Err(HeapCorruption::ZeroSizedBlock(at));
            }
            if at + units > end {
                return Err(HeapCorruption::Overrun(at));
            }
            let recorded = block.prev_block.load(Ordering::Relaxed);
            if recorded != prev {
                return Err(HeapCorruption::BrokenBackLink {
                    at,
                    recorded,
                    expected: prev,
                });
            }

            report.blocks += 1;
            if block.is_allocated() {
                report.allocated_blocks += 1;
                used_units += units;
                prev_free = false;
            } else {
                if prev_free {
                    return Err(HeapCorruption::Uncoalesced(prev, at));
                }
                report.free_blocks += 1;
                report.free_bytes += units as usize * UNIT;
                prev_free = true;
            }
            prev = at;
            at += units;
        }

        let mut listed = 0;
        let mut cur = SheepPtr::load(&self.header.free_head);
        while !cur.is_null() && listed <= report.blocks {
            listed += 1;
            cur = SheepPtr::load(&self.block(cur).next_free);
        }
        if listed != report.free_blocks {
            return Err(HeapCorruption::FreeListMismatch {
                listed,
                walked: report.free_blocks,
            });
        }

        let counter = self.header.used.load(Ordering::Relaxed);
        if counter != used_units {
            return Err(HeapCorruption::UsedMismatch {
                counter,
                walked: used_units,
            });
        }
        report.used_bytes = used_units as usize * UNIT;
        Ok(report)
    }
}

/// Payload units for a request; zero-byte requests still get one unit
const fn units_for_payload(bytes: usize) -> u32 {
    let units = units_for(bytes);
    if units == 0 {
        1
    } else {
        units
    }
}

// =============================================================================
// Tests
// =============================================================================
