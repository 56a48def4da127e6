//! Bitmap allocator for physical 4 KiB frames.
//!
//! One bit per frame over the whole physical address range: set means free,
//! clear means allocated. The bitmap itself is parked inside the first
//! usable memory-map region large enough to hold it (above the legacy 1 MiB
//! boundary) and marks its own backing frames allocated, so it can never be
//! handed out and overwritten.
//!
//! `free_size` is maintained incrementally by every [`free`](FrameAllocator::free)
//! and [`allocate`](FrameAllocator::allocate) call and always equals the
//! number of set bits times the page size.

use core::fmt;
use core::ptr::NonNull;

use kernel_info::boot::{MemoryMapEntry, MemoryRegionKind};
use kernel_info::memory::{LOW_MEMORY_BOUNDARY, PAGE_SIZE, pages_for};
use log::{info, warn};

use crate::addresses::PhysAddr;
use crate::phys_mapper::PhysMapper;

/// Frames tracked per bitmap byte.
const FRAMES_PER_BYTE: u64 = 8;

/// Errors surfaced by the frame allocator.
///
/// Policy stays with the caller: the boot path treats `EmptyMemoryMap` and
/// `OutOfMemory` as fatal and halts, while a double free is logged and
/// survived.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    /// The boot loader supplied no memory-map entries; the kernel cannot
    /// continue without memory topology.
    #[error("memory map contains no entries")]
    EmptyMemoryMap,

    /// No usable region above 1 MiB is large enough to host the bitmap.
    #[error("no usable region can hold the {0}-byte frame bitmap")]
    NoBitmapSpace(u64),

    /// Address is not frame-aligned; the bit arithmetic would silently
    /// corrupt a neighboring frame's tracking bit.
    #[error("address {0:#x} is not page-aligned")]
    Unaligned(u64),

    /// Range reaches past the highest tracked physical address.
    #[error("frame range {0:#x}..{1:#x} exceeds the physical limit")]
    OutOfRange(u64, u64),

    /// At least one frame in the range was already free. The whole range
    /// has still been freed.
    #[error("double free detected in range starting at {0:#x}")]
    DoubleFree(u64),

    /// At least one frame in the range is already allocated; nothing was
    /// changed.
    #[error("frame range starting at {0:#x} overlaps an existing allocation")]
    AlreadyAllocated(u64),

    /// First-fit search exhausted all of physical memory.
    #[error("out of physical memory: requested {requested} pages, {free} bytes free")]
    OutOfMemory { requested: u64, free: u64 },
}

/// Point-in-time accounting snapshot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryUsage {
    /// Bytes of countable memory reported by the boot loader.
    pub total: u64,
    /// Bytes currently free.
    pub free: u64,
}

impl MemoryUsage {
    #[inline]
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

impl fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} KiB total, {} KiB free, {} KiB used",
            self.total / 1024,
            self.free / 1024,
            self.used() / 1024
        )
    }
}

/// The physical frame allocator.
pub struct FrameAllocator {
    /// Highest physical address across usable/reclaimable/kernel entries.
    physical_limit: u64,
    total_size: u64,
    free_size: u64,
    bitmap: NonNull<u8>,
    bitmap_len: usize,
}

// Safety: the bitmap memory is owned exclusively by this allocator from
// initialization on; external synchronization (the manager's spin lock)
// serializes all access.
unsafe impl Send for FrameAllocator {}

impl fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("physical_limit", &self.physical_limit)
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

impl FrameAllocator {
    /// Build the allocator from the firmware memory map.
    ///
    /// # Safety
    /// `mapper` must give writable access to every physical region the map
    /// describes; the bitmap is placed inside one of them.
    ///
    /// # Errors
    /// [`FrameAllocError::EmptyMemoryMap`] without a single entry,
    /// [`FrameAllocError::NoBitmapSpace`] when no usable region fits the
    /// bitmap.
    pub unsafe fn new<M: PhysMapper>(
        mapper: &M,
        memory_map: &[MemoryMapEntry],
    ) -> Result<Self, FrameAllocError> {
        if memory_map.is_empty() {
            return Err(FrameAllocError::EmptyMemoryMap);
        }

        let mut physical_limit = 0;
        let mut total_size = 0;
        for entry in memory_map {
            if entry.kind.is_countable() {
                total_size += entry.length;
            }
            if entry.kind.raises_physical_limit() && entry.end() > physical_limit {
                physical_limit = entry.end();
            }
        }

        // Rounded up so frames in a trailing partial byte stay tracked.
        let bitmap_len = physical_limit.div_ceil(PAGE_SIZE * FRAMES_PER_BYTE);
        let bitmap_base = memory_map
            .iter()
            .filter(|entry| entry.kind == MemoryRegionKind::Usable)
            .filter_map(|entry| {
                let base = entry.base.max(LOW_MEMORY_BOUNDARY);
                (entry.end() >= base + bitmap_len).then_some(base)
            })
            .next()
            .ok_or(FrameAllocError::NoBitmapSpace(bitmap_len))?;

        // All-allocated by default; only explicit frees below open frames up.
        let bitmap_slice =
            unsafe { mapper.phys_to_slice_mut(PhysAddr::new(bitmap_base), bitmap_len as usize) };
        bitmap_slice.fill(0);

        let mut allocator = Self {
            physical_limit,
            total_size,
            free_size: 0,
            bitmap: NonNull::from(&mut bitmap_slice[0]),
            bitmap_len: bitmap_len as usize,
        };
        info!("frame bitmap: {bitmap_len} bytes at {bitmap_base:#x}");

        for entry in memory_map {
            if entry.kind != MemoryRegionKind::Usable || entry.end() <= LOW_MEMORY_BOUNDARY {
                continue;
            }
            let base = entry.base.max(LOW_MEMORY_BOUNDARY);
            let pages = (entry.end() - base) / PAGE_SIZE;
            if let Err(err) = allocator.free(PhysAddr::new(base), pages) {
                warn!("overlapping usable entries in memory map: {err}");
            }
        }

        // The bitmap must not describe its own frames as free.
        allocator.allocate(PhysAddr::new(bitmap_base), pages_for(bitmap_len))?;

        info!("physical memory: {}", allocator.usage());
        Ok(allocator)
    }

    /// Highest tracked physical address (exclusive).
    #[inline]
    #[must_use]
    pub const fn physical_limit(&self) -> u64 {
        self.physical_limit
    }

    /// Bytes currently free.
    #[inline]
    #[must_use]
    pub const fn free_size(&self) -> u64 {
        self.free_size
    }

    /// Bytes of countable memory.
    #[inline]
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    #[must_use]
    pub const fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            total: self.total_size,
            free: self.free_size,
        }
    }

    /// Mark `num_pages` frames starting at `address` free.
    ///
    /// The whole range is processed even when a double free is detected;
    /// the error is a diagnostic, not an abort.
    ///
    /// # Errors
    /// [`FrameAllocError::DoubleFree`] if any frame was already free;
    /// `Unaligned`/`OutOfRange` reject bad input without touching the bitmap.
    pub fn free(&mut self, address: PhysAddr, num_pages: u64) -> Result<(), FrameAllocError> {
        self.check_range(address, num_pages)?;

        let mut double_free = false;
        for n in 0..num_pages {
            let frame = address.as_u64() + n * PAGE_SIZE;
            if self.is_free(frame) {
                double_free = true;
            } else {
                self.free_size += PAGE_SIZE;
            }
            let (byte, mask) = Self::slot(frame);
            self.bitmap_mut()[byte] |= mask;
        }

        if double_free {
            return Err(FrameAllocError::DoubleFree(address.as_u64()));
        }
        Ok(())
    }

    /// Mark `num_pages` frames starting at `address` allocated.
    ///
    /// All-or-nothing: if any frame in the range is already allocated the
    /// bitmap is left untouched, so a frame can never be issued to two
    /// owners.
    ///
    /// # Errors
    /// [`FrameAllocError::AlreadyAllocated`] on any overlap;
    /// `Unaligned`/`OutOfRange` on bad input.
    pub fn allocate(&mut self, address: PhysAddr, num_pages: u64) -> Result<(), FrameAllocError> {
        self.check_range(address, num_pages)?;

        for n in 0..num_pages {
            if !self.is_free(address.as_u64() + n * PAGE_SIZE) {
                return Err(FrameAllocError::AlreadyAllocated(address.as_u64()));
            }
        }
        for n in 0..num_pages {
            let (byte, mask) = Self::slot(address.as_u64() + n * PAGE_SIZE);
            self.bitmap_mut()[byte] &= !mask;
        }
        self.free_size -= num_pages * PAGE_SIZE;
        Ok(())
    }

    /// First-fit search: claim `num_pages` contiguous frames, scanning one
    /// page at a time from `hint` up to the physical limit.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] when no fit exists; the boot path
    /// treats that as fatal, later callers may not.
    pub fn find_frames(
        &mut self,
        num_pages: u64,
        hint: PhysAddr,
    ) -> Result<PhysAddr, FrameAllocError> {
        debug_assert!(num_pages > 0);

        let Some(span) = num_pages.checked_mul(PAGE_SIZE) else {
            return Err(FrameAllocError::OutOfMemory {
                requested: num_pages,
                free: self.free_size,
            });
        };
        let mut candidate = hint.frame_base().as_u64();
        while candidate
            .checked_add(span)
            .is_some_and(|end| end <= self.physical_limit)
        {
            let base = PhysAddr::new(candidate);
            if self.allocate(base, num_pages).is_ok() {
                return Ok(base);
            }
            candidate += PAGE_SIZE;
        }

        Err(FrameAllocError::OutOfMemory {
            requested: num_pages,
            free: self.free_size,
        })
    }

    fn check_range(&self, address: PhysAddr, num_pages: u64) -> Result<(), FrameAllocError> {
        if !address.is_page_aligned() {
            return Err(FrameAllocError::Unaligned(address.as_u64()));
        }
        // Checked arithmetic: a wrapped end would slip past the limit check.
        let end = num_pages
            .checked_mul(PAGE_SIZE)
            .and_then(|span| address.as_u64().checked_add(span))
            .ok_or(FrameAllocError::OutOfRange(address.as_u64(), u64::MAX))?;
        if end > self.physical_limit {
            return Err(FrameAllocError::OutOfRange(address.as_u64(), end));
        }
        Ok(())
    }

    /// Byte index and bit mask tracking the frame at `address`.
    #[inline]
    const fn slot(address: u64) -> (usize, u8) {
        let frame = address / PAGE_SIZE;
        ((frame / FRAMES_PER_BYTE) as usize, 1 << (frame % FRAMES_PER_BYTE))
    }

    #[inline]
    fn is_free(&self, address: u64) -> bool {
        let (byte, mask) = Self::slot(address);
        self.bitmap_ref()[byte] & mask != 0
    }

    #[inline]
    fn bitmap_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.bitmap.as_ptr(), self.bitmap_len) }
    }

    #[inline]
    fn bitmap_ref(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.bitmap.as_ptr(), self.bitmap_len) }
    }
}
