//! # Kernel Memory Management
//!
//! Physical frame allocation and x86-64 virtual address-space management,
//! the foundation every later kernel subsystem allocates from and maps
//! through.
//!
//! ## Layers
//!
//! - [`FrameAllocator`] — a bitmap over all physical 4 KiB frames, built from
//!   the boot loader's memory map. One bit per frame, set = free.
//! - [`AddressSpace`] — one PML4-rooted page-table tree plus the list of
//!   frames backing its intermediate tables, guarded by a spin lock.
//! - [`MemoryManager`] — owns the frame allocator, the kernel address space,
//!   and the global-mapping list; the single entry point the rest of the
//!   kernel talks to.
//!
//! ## x86-64 translation walk
//!
//! A 48-bit virtual address is split into four 9-bit table indices plus a
//! 12-bit page offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each index selects one of 512 eight-byte entries; the PT entry is the
//! leaf that names the physical frame. Intermediate tables are created
//! lazily on the first mapping that needs them and reclaimed as soon as
//! they become empty again.
//!
//! ## Global mappings
//!
//! Mappings made with no explicit address space (kernel image, framebuffer,
//! reclaimable firmware regions, device MMIO) are recorded and replayed into
//! every address space created later, so all contexts share the same kernel
//! view. See [`MemoryManager::map`].
//!
//! ## Physical access
//!
//! Page tables and the frame bitmap live in physical memory. All access to
//! them goes through a [`PhysMapper`], which turns a physical address into a
//! usable reference — the higher-half direct map in the running kernel
//! ([`DirectPhysMapper`]), or a simulated RAM buffer in the host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod addresses;
mod frame_alloc;
mod manager;
mod page_table;
mod phys_mapper;
mod tlb;

pub use address_space::{AddressSpace, MapError};
pub use addresses::{PhysAddr, VirtAddr};
pub use frame_alloc::{FrameAllocError, FrameAllocator, MemoryUsage};
pub use manager::{GlobalMapping, MemoryInitError, MemoryManager};
pub use page_table::{PAGE_TABLE_ENTRIES, PageFlags, PageTable, PageTableEntry};
pub use phys_mapper::{DirectPhysMapper, PhysMapper};

/// View the page table stored in `frame` through the mapper.
///
/// # Safety
/// - `frame` must be a 4 KiB frame holding (or about to hold) a page table.
/// - The mapper must yield a writable view of it.
#[inline]
pub(crate) unsafe fn table_at<'a, M: PhysMapper>(mapper: &M, frame: PhysAddr) -> &'a mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(frame) }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{PhysAddr, PhysMapper};
    use kernel_info::boot::{MemoryMapEntry, MemoryRegionKind};

    /// One 4 KiB frame of simulated physical memory.
    #[repr(align(4096))]
    struct Frame([u8; 4096]);

    /// Simulated physical RAM: a contiguous run of zeroed frames starting at
    /// physical address zero, plus a [`PhysMapper`] that resolves a physical
    /// address to a pointer into the buffer.
    pub(crate) struct SimPhys {
        frames: Vec<Frame>,
    }

    impl SimPhys {
        pub(crate) fn with_frames(count: usize) -> Self {
            let mut frames = Vec::with_capacity(count);
            for _ in 0..count {
                frames.push(Frame([0u8; 4096]));
            }
            Self { frames }
        }

        fn base(&self) -> *mut u8 {
            self.frames.as_ptr().cast::<u8>().cast_mut()
        }
    }

    impl PhysMapper for SimPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let offset = usize::try_from(pa.as_u64()).unwrap();
            assert!(
                offset + size_of::<T>() <= self.frames.len() * 4096,
                "access at {pa} outside simulated RAM"
            );
            unsafe { &mut *self.base().add(offset).cast::<T>() }
        }
    }

    pub(crate) fn entry(base: u64, length: u64, kind: MemoryRegionKind) -> MemoryMapEntry {
        MemoryMapEntry { base, length, kind }
    }

    pub(crate) fn usable(base: u64, length: u64) -> MemoryMapEntry {
        entry(base, length, MemoryRegionKind::Usable)
    }
}
