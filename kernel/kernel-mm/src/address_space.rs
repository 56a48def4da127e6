//! A single virtual address space: one PML4-rooted page-table tree.
//!
//! Intermediate tables (PDPT, PD, PT) are allocated lazily on the first
//! mapping that walks through them and reclaimed as soon as the last entry
//! in them is cleared, cascading upward. The frames backing those tables are
//! tracked per address space so the whole tree can be torn down.

use alloc::vec::Vec;
use core::fmt;

use kernel_sync::SpinLock;
use log::warn;

use crate::addresses::{PhysAddr, VirtAddr};
use crate::frame_alloc::{FrameAllocError, FrameAllocator};
use crate::page_table::{PageFlags, PageTable, PageTableEntry};
use crate::phys_mapper::PhysMapper;
use crate::table_at;

/// Errors surfaced when building or changing mappings.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// The virtual address is not page-aligned.
    #[error("virtual address {0:#x} is not page-aligned")]
    UnalignedVirt(u64),

    /// The physical address is not page-aligned.
    #[error("physical address {0:#x} is not page-aligned")]
    UnalignedPhys(u64),

    /// An intermediate table (or the mapping's bookkeeping) could not be
    /// allocated.
    #[error(transparent)]
    OutOfMemory(#[from] FrameAllocError),
}

struct AddressSpaceInner {
    /// Frame holding the PML4.
    root: PhysAddr,
    /// Frames backing intermediate tables, for teardown.
    table_frames: Vec<PhysAddr>,
}

/// One page-table tree, locked as a unit.
///
/// The lock covers the walk and the table-frame list together, so a
/// concurrent map and unmap can never observe a half-linked intermediate
/// table.
pub struct AddressSpace {
    inner: SpinLock<AddressSpaceInner>,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AddressSpace")
            .field("root", &inner.root)
            .field("table_frames", &inner.table_frames.len())
            .finish()
    }
}

impl AddressSpace {
    /// Wrap an already-zeroed PML4 frame.
    pub(crate) fn new(root: PhysAddr) -> Self {
        Self {
            inner: SpinLock::new(AddressSpaceInner {
                root,
                table_frames: Vec::new(),
            }),
        }
    }

    /// Frame holding this space's PML4; the value loaded into CR3 to
    /// activate it.
    #[must_use]
    pub fn root(&self) -> PhysAddr {
        self.inner.lock().root
    }

    /// Number of intermediate table frames currently allocated.
    #[cfg(test)]
    pub(crate) fn table_frame_count(&self) -> usize {
        self.inner.lock().table_frames.len()
    }

    /// Map the page at `va` to the frame at `pa`.
    ///
    /// Missing intermediate tables are allocated, zeroed, and linked with
    /// permissive flags; the leaf entry carries `flags` and decides the
    /// effective permissions. An existing leaf at `va` is overwritten.
    pub(crate) fn map_page<M: PhysMapper>(
        &self,
        mapper: &M,
        frames: &SpinLock<FrameAllocator>,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let inner = &mut *self.inner.lock();

        // SAFETY: root and every frame ensure_table returns hold page
        // tables owned by this address space; the lock is held.
        let pml4 = unsafe { table_at(mapper, inner.root) };
        let pdpt_frame = ensure_table(mapper, frames, &mut inner.table_frames, pml4, va.pml4_index())?;
        let pdpt = unsafe { table_at(mapper, pdpt_frame) };
        let pd_frame = ensure_table(mapper, frames, &mut inner.table_frames, pdpt, va.pdpt_index())?;
        let pd = unsafe { table_at(mapper, pd_frame) };
        let pt_frame = ensure_table(mapper, frames, &mut inner.table_frames, pd, va.pd_index())?;
        let pt = unsafe { table_at(mapper, pt_frame) };

        pt.set_entry(
            va.pt_index(),
            PageTableEntry::compose(pa, flags | PageFlags::PRESENT),
        );
        Ok(())
    }

    /// Remove the mapping for the page at `va`, if any.
    ///
    /// Tables left empty by the removal are freed and unlinked from their
    /// parent, cascading up to (but never including) the PML4. Unmapping an
    /// address that was never mapped is a no-op.
    ///
    /// Returns whether a leaf entry was actually cleared.
    pub(crate) fn unmap_page<M: PhysMapper>(
        &self,
        mapper: &M,
        frames: &SpinLock<FrameAllocator>,
        va: VirtAddr,
    ) -> bool {
        let inner = &mut *self.inner.lock();

        // SAFETY: as in map_page; every followed entry was written by us.
        let pml4 = unsafe { table_at(mapper, inner.root) };
        let pml4e = pml4.entry(va.pml4_index());
        if !pml4e.present() {
            return false;
        }
        let pdpt = unsafe { table_at(mapper, pml4e.frame()) };
        let pdpte = pdpt.entry(va.pdpt_index());
        if !pdpte.present() {
            return false;
        }
        let pd = unsafe { table_at(mapper, pdpte.frame()) };
        let pde = pd.entry(va.pd_index());
        if !pde.present() {
            return false;
        }
        let pt = unsafe { table_at(mapper, pde.frame()) };
        if !pt.entry(va.pt_index()).present() {
            return false;
        }
        pt.clear_entry(va.pt_index());

        // Reclaim emptied tables bottom-up.
        if pt.is_empty() {
            release_table(frames, &mut inner.table_frames, pde.frame());
            pd.clear_entry(va.pd_index());

            if pd.is_empty() {
                release_table(frames, &mut inner.table_frames, pdpte.frame());
                pdpt.clear_entry(va.pdpt_index());

                if pdpt.is_empty() {
                    release_table(frames, &mut inner.table_frames, pml4e.frame());
                    pml4.clear_entry(va.pml4_index());
                }
            }
        }
        true
    }

    /// Walk the tree for the page containing `va` and return the physical
    /// frame it maps to, masked to the frame boundary, or `None` if any
    /// level is absent.
    pub(crate) fn translate<M: PhysMapper>(&self, mapper: &M, va: VirtAddr) -> Option<PhysAddr> {
        let inner = self.inner.lock();

        let mut frame = inner.root;
        for index in [va.pml4_index(), va.pdpt_index(), va.pd_index()] {
            // SAFETY: present entries in this tree always point at tables
            // we wrote.
            let entry = unsafe { table_at(mapper, frame) }.entry(index);
            if !entry.present() {
                return None;
            }
            frame = entry.frame();
        }

        let leaf = unsafe { table_at(mapper, frame) }.entry(va.pt_index());
        leaf.present().then_some(leaf.frame())
    }

    /// Tear the tree down, returning every table frame and the root to the
    /// allocator. Mapped *target* frames are not freed; the address space
    /// does not own them.
    pub(crate) fn dispose(self, frames: &SpinLock<FrameAllocator>) {
        let inner = self.inner.into_inner();
        frames.with_lock(|alloc| {
            for frame in inner.table_frames {
                if let Err(err) = alloc.free(frame, 1) {
                    warn!("disposing address space {}: {err}", inner.root);
                }
            }
            if let Err(err) = alloc.free(inner.root, 1) {
                warn!("disposing address space root: {err}");
            }
        });
    }
}

/// Follow (or create) the intermediate table behind `parent[index]`.
fn ensure_table<M: PhysMapper>(
    mapper: &M,
    frames: &SpinLock<FrameAllocator>,
    table_frames: &mut Vec<PhysAddr>,
    parent: &mut PageTable,
    index: usize,
) -> Result<PhysAddr, FrameAllocError> {
    let entry = parent.entry(index);
    if entry.present() {
        return Ok(entry.frame());
    }

    let frame = frames.with_lock(|alloc| alloc.find_frames(1, PhysAddr::zero()))?;
    // SAFETY: the frame was just claimed from the allocator for this table.
    unsafe { table_at(mapper, frame) }.zero();
    parent.set_entry(index, PageTableEntry::compose(frame, PageFlags::TABLE));
    table_frames.push(frame);
    Ok(frame)
}

/// Return an emptied intermediate table's frame to the allocator and drop it
/// from the bookkeeping list.
fn release_table(
    frames: &SpinLock<FrameAllocator>,
    table_frames: &mut Vec<PhysAddr>,
    frame: PhysAddr,
) {
    table_frames.retain(|f| *f != frame);
    if let Err(err) = frames.with_lock(|alloc| alloc.free(frame, 1)) {
        warn!("releasing emptied page table {frame}: {err}");
    }
}
