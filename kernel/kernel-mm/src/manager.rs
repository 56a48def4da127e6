//! The memory manager: frame allocator, kernel address space, and the
//! global-mapping list behind one facade.
//!
//! ## Global mappings
//!
//! A mapping requested without a target address space goes into the kernel
//! address space *and* onto a recorded list. [`MemoryManager::create_address_space`]
//! replays that list into every new space, so the kernel image, firmware
//! regions, and device windows are visible in all contexts. The boot-time
//! direct map is deliberately not recorded; fresh address spaces only carry
//! the explicit globals.

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use kernel_info::boot::{KernelAddressInfo, MemoryMapEntry, MemoryRegionKind};
use kernel_info::memory::{DIRECT_MAP_WINDOW, PAGE_SIZE, pages_for, phys_to_virt};
use kernel_sync::SpinLock;
use log::{debug, info, warn};

use crate::address_space::{AddressSpace, MapError};
use crate::addresses::{PhysAddr, VirtAddr};
use crate::frame_alloc::{FrameAllocError, FrameAllocator, MemoryUsage};
use crate::page_table::PageFlags;
use crate::phys_mapper::PhysMapper;
use crate::{table_at, tlb};

/// One recorded kernel-global mapping, replayed into every created address
/// space.
#[derive(Copy, Clone, Debug)]
pub struct GlobalMapping {
    pub virt_addr: VirtAddr,
    pub phys_addr: PhysAddr,
    pub num_pages: u64,
    pub flags: PageFlags,
}

/// Errors during memory-manager bring-up.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MemoryInitError {
    #[error("frame allocator init failed: {0}")]
    FrameAlloc(#[from] FrameAllocError),

    #[error("boot mapping failed: {0}")]
    Map(#[from] MapError),
}

/// Owner of all physical frames and virtual address spaces.
///
/// Interior locking (the frame allocator and the global list each behind a
/// spin lock, every address space behind its own) means callers share the
/// manager by reference without any outer lock.
pub struct MemoryManager<M: PhysMapper> {
    mapper: M,
    frames: SpinLock<FrameAllocator>,
    globals: SpinLock<Vec<GlobalMapping>>,
    kernel_space: AddressSpace,
    /// Root frame of the address space currently loaded in CR3, or zero
    /// before the first activation. Used to decide whether a change needs a
    /// TLB flush.
    active_root: AtomicU64,
}

impl<M: PhysMapper> fmt::Debug for MemoryManager<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("kernel_root", &self.kernel_space.root())
            .field("active_root", &self.active_root.load(Ordering::Acquire))
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Bring up memory management from the boot loader's handoff.
    ///
    /// Builds the frame allocator, then the kernel address space: a direct
    /// map of physical memory (up to [`DIRECT_MAP_WINDOW`]) plus recorded
    /// global mappings for the kernel image, the framebuffer, and the
    /// usable/reclaimable regions.
    ///
    /// # Safety
    /// - `memory_map` must describe the machine truthfully.
    /// - `mapper` must give writable access to all usable physical memory.
    /// - Must be called once, before any other use of physical memory.
    pub unsafe fn new(
        mapper: M,
        memory_map: &[MemoryMapEntry],
        kernel_addr: KernelAddressInfo,
    ) -> Result<Self, MemoryInitError> {
        let mut allocator = unsafe { FrameAllocator::new(&mapper, memory_map) }?;

        let root = allocator.find_frames(1, PhysAddr::zero())?;
        // SAFETY: the frame was just claimed for the PML4.
        unsafe { table_at(&mapper, root) }.zero();

        let manager = Self {
            frames: SpinLock::new(allocator),
            globals: SpinLock::new(Vec::new()),
            kernel_space: AddressSpace::new(root),
            active_root: AtomicU64::new(0),
            mapper,
        };

        // Boot-time direct map. Not recorded: new address spaces get only
        // the explicit globals below, never a full view of physical memory.
        let direct_limit = manager
            .frames
            .lock()
            .physical_limit()
            .min(DIRECT_MAP_WINDOW);
        let mut pa = 0;
        while pa < direct_limit {
            manager.kernel_space.map_page(
                &manager.mapper,
                &manager.frames,
                VirtAddr::new(phys_to_virt(pa)),
                PhysAddr::new(pa),
                PageFlags::DEFAULT,
            )?;
            pa += PAGE_SIZE;
        }
        info!("direct map covers {direct_limit:#x} bytes");

        for entry in memory_map {
            let pages = pages_for(entry.length);
            let pa = PhysAddr::new(entry.base);
            match entry.kind {
                MemoryRegionKind::KernelAndModules => {
                    // The image is linked high; map it where the linker put it.
                    let Some(offset) = entry.base.checked_sub(kernel_addr.physical_base) else {
                        warn!(
                            "kernel region at {pa} lies below the image base {:#x}; skipping",
                            kernel_addr.physical_base
                        );
                        continue;
                    };
                    let va = kernel_addr.virtual_base + offset;
                    manager.map(None, VirtAddr::new(va), pa, pages, PageFlags::DEFAULT)?;
                }
                MemoryRegionKind::Framebuffer => {
                    manager.map(
                        None,
                        VirtAddr::new(phys_to_virt(entry.base)),
                        pa,
                        pages,
                        PageFlags::MMIO,
                    )?;
                }
                MemoryRegionKind::Usable
                | MemoryRegionKind::AcpiReclaimable
                | MemoryRegionKind::BootloaderReclaimable => {
                    manager.map(
                        None,
                        VirtAddr::new(phys_to_virt(entry.base)),
                        pa,
                        pages,
                        PageFlags::DEFAULT,
                    )?;
                }
                MemoryRegionKind::Reserved
                | MemoryRegionKind::AcpiNvs
                | MemoryRegionKind::BadMemory => {
                    debug!("not mapping {} region at {pa}", entry.kind);
                }
            }
        }

        info!(
            "kernel address space at {} with {} global mappings",
            manager.kernel_space.root(),
            manager.globals.lock().len()
        );
        Ok(manager)
    }

    /// The kernel's own address space.
    #[must_use]
    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    /// Map `num_pages` pages starting at `va` to the physical range starting
    /// at `pa`.
    ///
    /// With `space == None` the mapping goes into the kernel address space
    /// and is recorded as a global, inherited by every address space created
    /// afterwards. Existing address spaces are not retrofitted.
    ///
    /// # Errors
    /// Misaligned addresses are rejected up front; running out of frames for
    /// intermediate tables surfaces as [`MapError::OutOfMemory`].
    pub fn map(
        &self,
        space: Option<&AddressSpace>,
        va: VirtAddr,
        pa: PhysAddr,
        num_pages: u64,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() {
            return Err(MapError::UnalignedVirt(va.as_u64()));
        }
        if !pa.is_page_aligned() {
            return Err(MapError::UnalignedPhys(pa.as_u64()));
        }

        match space {
            Some(space) => self.map_into(space, va, pa, num_pages, flags),
            None => {
                self.globals.with_lock(|globals| {
                    if globals.iter().any(|g| g.virt_addr == va) {
                        warn!("global mapping at {va} shadows an earlier one");
                    }
                    globals.push(GlobalMapping {
                        virt_addr: va,
                        phys_addr: pa,
                        num_pages,
                        flags,
                    });
                });
                self.map_into(&self.kernel_space, va, pa, num_pages, flags)
            }
        }
    }

    /// Unmap `num_pages` pages starting at `va`.
    ///
    /// With `space == None` this targets the kernel address space and drops
    /// the matching global record, so future address spaces no longer
    /// inherit the mapping. The record is matched on `(va, num_pages)`
    /// exactly; partial unmaps of a global leave the record in place.
    pub fn unmap(&self, space: Option<&AddressSpace>, va: VirtAddr, num_pages: u64) -> Result<(), MapError> {
        if !va.is_page_aligned() {
            return Err(MapError::UnalignedVirt(va.as_u64()));
        }

        let space = match space {
            Some(space) => space,
            None => {
                self.globals.with_lock(|globals| {
                    let before = globals.len();
                    globals.retain(|g| !(g.virt_addr == va && g.num_pages == num_pages));
                    if globals.len() == before {
                        debug!("no global mapping recorded at {va} for {num_pages} pages");
                    }
                });
                &self.kernel_space
            }
        };

        for n in 0..num_pages {
            let page = va.add_pages(n);
            if space.unmap_page(&self.mapper, &self.frames, page) {
                self.flush_if_active(space, page);
            }
        }
        Ok(())
    }

    /// Resolve `va` to the base of the physical frame it currently maps to,
    /// in the given address space or the kernel's.
    #[must_use]
    pub fn physical_address(&self, space: Option<&AddressSpace>, va: VirtAddr) -> Option<PhysAddr> {
        space
            .unwrap_or(&self.kernel_space)
            .translate(&self.mapper, va)
    }

    /// Create a fresh address space carrying all currently recorded global
    /// mappings.
    ///
    /// # Errors
    /// On allocation failure mid-replay the partially built tree is torn
    /// down and its frames returned before the error is surfaced.
    pub fn create_address_space(&self) -> Result<AddressSpace, MapError> {
        let root = self
            .frames
            .with_lock(|alloc| alloc.find_frames(1, PhysAddr::zero()))?;
        // SAFETY: the frame was just claimed for the new PML4.
        unsafe { table_at(&self.mapper, root) }.zero();
        let space = AddressSpace::new(root);

        // Snapshot under the lock, replay outside it.
        let globals: Vec<GlobalMapping> = self.globals.lock().clone();
        for g in &globals {
            if let Err(err) =
                self.map_into(&space, g.virt_addr, g.phys_addr, g.num_pages, g.flags)
            {
                space.dispose(&self.frames);
                return Err(err);
            }
        }

        debug!("created address space at {root} with {} globals", globals.len());
        Ok(space)
    }

    /// Tear down an address space, returning all of its page-table frames.
    ///
    /// The caller must not dispose the currently active space.
    pub fn destroy_address_space(&self, space: AddressSpace) {
        debug_assert_ne!(
            self.active_root.load(Ordering::Acquire),
            space.root().as_u64()
        );
        space.dispose(&self.frames);
    }

    /// Switch the CPU to `space`.
    ///
    /// # Safety
    /// `space` must keep the currently executing code, stack, and data
    /// mapped, or the switch faults immediately.
    pub unsafe fn activate(&self, space: &AddressSpace) {
        let root = space.root();
        self.active_root.store(root.as_u64(), Ordering::Release);
        unsafe { tlb::load_root(root) };
    }

    /// Switch the CPU to the kernel address space.
    ///
    /// # Safety
    /// See [`activate`](Self::activate).
    pub unsafe fn activate_kernel_space(&self) {
        unsafe { self.activate(&self.kernel_space) };
    }

    /// Claim `num_pages` contiguous frames, scanning from `hint`.
    pub fn find_frames(&self, num_pages: u64, hint: PhysAddr) -> Result<PhysAddr, FrameAllocError> {
        self.frames
            .with_lock(|alloc| alloc.find_frames(num_pages, hint))
    }

    /// Mark a specific frame range allocated.
    pub fn allocate_frames(&self, address: PhysAddr, num_pages: u64) -> Result<(), FrameAllocError> {
        self.frames
            .with_lock(|alloc| alloc.allocate(address, num_pages))
    }

    /// Return a frame range to the allocator.
    pub fn free_frames(&self, address: PhysAddr, num_pages: u64) -> Result<(), FrameAllocError> {
        self.frames.with_lock(|alloc| alloc.free(address, num_pages))
    }

    /// Current physical-memory accounting.
    #[must_use]
    pub fn usage(&self) -> MemoryUsage {
        self.frames.lock().usage()
    }

    fn map_into(
        &self,
        space: &AddressSpace,
        va: VirtAddr,
        pa: PhysAddr,
        num_pages: u64,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        for n in 0..num_pages {
            let page = va.add_pages(n);
            space.map_page(&self.mapper, &self.frames, page, pa.add_pages(n), flags)?;
            self.flush_if_active(space, page);
        }
        Ok(())
    }

    /// Flush one page from the TLB if `space` is the one loaded in CR3.
    /// Changes to inactive trees take effect when the tree is next loaded.
    fn flush_if_active(&self, space: &AddressSpace, va: VirtAddr) {
        if self.active_root.load(Ordering::Acquire) == space.root().as_u64() {
            // SAFETY: the tree being modified is the active one.
            unsafe { tlb::invalidate_page(va) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SimPhys, entry, usable};
    use kernel_info::memory::DIRECT_MAP_BASE;

    const KERNEL_VIRT_BASE: u64 = 0xffff_ffff_8000_0000;
    const KERNEL_PHYS_BASE: u64 = 0x12_0000;
    const FRAMEBUFFER_BASE: u64 = 0x12_c000;

    /// Usable RAM at 1 MiB, then the kernel image, ACPI tables, the
    /// framebuffer, and a reserved hole.
    fn memory_map() -> [MemoryMapEntry; 5] {
        [
            usable(0x10_0000, 0x2_0000),
            entry(KERNEL_PHYS_BASE, 0x8000, MemoryRegionKind::KernelAndModules),
            entry(0x12_8000, 0x4000, MemoryRegionKind::AcpiReclaimable),
            entry(FRAMEBUFFER_BASE, 0x4000, MemoryRegionKind::Framebuffer),
            entry(0x13_0000, 0x8000, MemoryRegionKind::Reserved),
        ]
    }

    fn kernel_addr() -> KernelAddressInfo {
        KernelAddressInfo {
            physical_base: KERNEL_PHYS_BASE,
            virtual_base: KERNEL_VIRT_BASE,
        }
    }

    fn manager(phys: &SimPhys) -> MemoryManager<&SimPhys> {
        unsafe { MemoryManager::new(phys, &memory_map(), kernel_addr()) }.unwrap()
    }

    fn direct(pa: u64) -> VirtAddr {
        VirtAddr::new(DIRECT_MAP_BASE + pa)
    }

    #[test]
    fn empty_memory_map_fails_init() {
        let phys = SimPhys::with_frames(4);
        let err = unsafe { MemoryManager::new(&phys, &[], kernel_addr()) }.unwrap_err();
        assert_eq!(
            err,
            MemoryInitError::FrameAlloc(FrameAllocError::EmptyMemoryMap)
        );
    }

    #[test]
    fn boot_mappings_are_in_place() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);

        // Kernel image at its link address.
        assert_eq!(
            mm.physical_address(None, VirtAddr::new(KERNEL_VIRT_BASE + 0x1000)),
            Some(PhysAddr::new(KERNEL_PHYS_BASE + 0x1000))
        );
        // Framebuffer and ACPI tables at their direct-map view.
        assert_eq!(
            mm.physical_address(None, direct(FRAMEBUFFER_BASE)),
            Some(PhysAddr::new(FRAMEBUFFER_BASE))
        );
        assert_eq!(
            mm.physical_address(None, direct(0x12_8000)),
            Some(PhysAddr::new(0x12_8000))
        );
        // The direct map starts at physical zero.
        assert_eq!(
            mm.physical_address(None, direct(0)),
            Some(PhysAddr::zero())
        );
        // The reserved hole sits past the physical limit; nothing maps it
        // beyond the bulk window.
        assert_eq!(mm.physical_address(None, direct(0x13_0000)), None);
    }

    #[test]
    fn created_spaces_inherit_globals_but_not_the_direct_map() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);
        let space = mm.create_address_space().unwrap();

        // Globals replayed: kernel image and framebuffer.
        assert_eq!(
            mm.physical_address(Some(&space), VirtAddr::new(KERNEL_VIRT_BASE)),
            Some(PhysAddr::new(KERNEL_PHYS_BASE))
        );
        assert_eq!(
            mm.physical_address(Some(&space), direct(FRAMEBUFFER_BASE)),
            Some(PhysAddr::new(FRAMEBUFFER_BASE))
        );
        // The unrecorded direct map is absent.
        assert_eq!(mm.physical_address(Some(&space), direct(0)), None);

        mm.destroy_address_space(space);
    }

    #[test]
    fn globals_recorded_after_creation_do_not_retrofit() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);
        let early = mm.create_address_space().unwrap();

        let va = VirtAddr::new(0xffff_9000_0000_0000);
        mm.map(None, va, PhysAddr::new(0x11_0000), 1, PageFlags::DEFAULT)
            .unwrap();
        let late = mm.create_address_space().unwrap();

        assert_eq!(mm.physical_address(Some(&early), va), None);
        assert_eq!(
            mm.physical_address(Some(&late), va),
            Some(PhysAddr::new(0x11_0000))
        );

        mm.destroy_address_space(early);
        mm.destroy_address_space(late);
    }

    #[test]
    fn global_unmap_drops_the_record() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);

        let va = VirtAddr::new(0xffff_9000_0000_0000);
        mm.map(None, va, PhysAddr::new(0x11_0000), 2, PageFlags::DEFAULT)
            .unwrap();
        mm.unmap(None, va, 2).unwrap();

        assert_eq!(mm.physical_address(None, va), None);
        let space = mm.create_address_space().unwrap();
        assert_eq!(mm.physical_address(Some(&space), va), None);
        mm.destroy_address_space(space);
    }

    #[test]
    fn map_unmap_roundtrip_restores_frame_accounting() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);
        let space = mm.create_address_space().unwrap();
        let free_before = mm.usage().free;

        // A corner of the address space no global touches: full walk with
        // three fresh intermediate tables.
        let va = VirtAddr::new(0x0000_7f00_0000_0000);
        mm.map(Some(&space), va, PhysAddr::new(0x11_0000), 4, PageFlags::USERMODE)
            .unwrap();
        assert_eq!(mm.usage().free, free_before - 3 * PAGE_SIZE);
        assert_eq!(
            mm.physical_address(Some(&space), va.add_pages(3)),
            Some(PhysAddr::new(0x11_3000))
        );

        mm.unmap(Some(&space), va, 4).unwrap();
        assert_eq!(mm.physical_address(Some(&space), va), None);
        // The cascade reclaimed all three tables.
        assert_eq!(mm.usage().free, free_before);

        // Unmapping again is a harmless no-op.
        mm.unmap(Some(&space), va, 4).unwrap();
        assert_eq!(mm.usage().free, free_before);

        mm.destroy_address_space(space);
    }

    #[test]
    fn kernel_entry_below_the_image_base_is_skipped() {
        let phys = SimPhys::with_frames(0x120);
        // A stray kernel-and-modules entry below the reported image base;
        // its offset cannot be formed, so it must be skipped, not wrapped.
        let map = [
            usable(0x10_0000, 0x2_0000),
            entry(0x4000, 0x4000, MemoryRegionKind::KernelAndModules),
            entry(KERNEL_PHYS_BASE, 0x8000, MemoryRegionKind::KernelAndModules),
        ];
        let mm = unsafe { MemoryManager::new(&phys, &map, kernel_addr()) }.unwrap();

        // The real image is mapped at its link address as usual.
        assert_eq!(
            mm.physical_address(None, VirtAddr::new(KERNEL_VIRT_BASE)),
            Some(PhysAddr::new(KERNEL_PHYS_BASE))
        );
        // Only the image mapping was recorded, not the stray entry.
        let space = mm.create_address_space().unwrap();
        assert_eq!(
            mm.physical_address(Some(&space), VirtAddr::new(KERNEL_VIRT_BASE)),
            Some(PhysAddr::new(KERNEL_PHYS_BASE))
        );
        mm.destroy_address_space(space);
    }

    #[test]
    fn misaligned_requests_are_rejected() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);

        let err = mm
            .map(
                None,
                VirtAddr::new(0xffff_9000_0000_0800),
                PhysAddr::new(0x11_0000),
                1,
                PageFlags::DEFAULT,
            )
            .unwrap_err();
        assert_eq!(err, MapError::UnalignedVirt(0xffff_9000_0000_0800));

        let err = mm
            .map(
                None,
                VirtAddr::new(0xffff_9000_0000_0000),
                PhysAddr::new(0x11_0800),
                1,
                PageFlags::DEFAULT,
            )
            .unwrap_err();
        assert_eq!(err, MapError::UnalignedPhys(0x11_0800));

        let err = mm
            .unmap(None, VirtAddr::new(0xffff_9000_0000_0800), 1)
            .unwrap_err();
        assert_eq!(err, MapError::UnalignedVirt(0xffff_9000_0000_0800));
    }

    #[test]
    fn lower_half_mapping_in_a_fresh_space() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);
        let space = mm.create_address_space().unwrap();

        let va = VirtAddr::new(0x0000_8000_0000_0000);
        assert_eq!(mm.physical_address(Some(&space), va), None);
        mm.map(Some(&space), va, PhysAddr::new(0x20_0000), 1, PageFlags::USERMODE)
            .unwrap();
        assert_eq!(
            mm.physical_address(Some(&space), va),
            Some(PhysAddr::new(0x20_0000))
        );
        // Kernel space is untouched by the private mapping.
        assert_eq!(mm.physical_address(None, direct(0)), Some(PhysAddr::zero()));

        mm.destroy_address_space(space);
    }

    #[test]
    fn create_rolls_back_on_exhaustion() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);

        // Drain all but two frames: enough for the root and one table, not
        // for the full global replay.
        loop {
            let free = mm.usage().free / PAGE_SIZE;
            if free <= 2 {
                break;
            }
            mm.find_frames(1, PhysAddr::zero()).unwrap();
        }
        let free_before = mm.usage().free;

        let err = mm.create_address_space().unwrap_err();
        assert!(matches!(err, MapError::OutOfMemory(_)));
        // The partial tree was torn down; nothing leaked.
        assert_eq!(mm.usage().free, free_before);
    }

    #[test]
    fn frame_passthrough_operations() {
        let phys = SimPhys::with_frames(0x120);
        let mm = manager(&phys);
        let free_before = mm.usage().free;

        let frames = mm.find_frames(2, PhysAddr::zero()).unwrap();
        assert_eq!(mm.usage().free, free_before - 2 * PAGE_SIZE);
        mm.free_frames(frames, 2).unwrap();
        assert_eq!(mm.usage().free, free_before);

        mm.allocate_frames(frames, 2).unwrap();
        assert_eq!(
            mm.allocate_frames(frames, 1),
            Err(FrameAllocError::AlreadyAllocated(frames.as_u64()))
        );
        mm.free_frames(frames, 2).unwrap();
    }
}
