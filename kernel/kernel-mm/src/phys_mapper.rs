//! Access to physical memory from code that can only dereference virtual
//! addresses.
//!
//! Page tables and the frame bitmap live in physical frames. Whoever wants
//! to read or write them needs a translation from a physical address to a
//! pointer that is valid in the *current* address space. How that
//! translation works differs by context — the running kernel uses the
//! higher-half direct map, the host tests use a buffer standing in for RAM —
//! so it sits behind a trait.

use crate::addresses::PhysAddr;
use kernel_info::memory::phys_to_virt;

/// Resolves physical addresses to usable references in the current
/// virtual address space.
pub trait PhysMapper {
    /// View the bytes at `pa` as a `&mut T`.
    ///
    /// # Safety
    /// - `pa` must be mapped and writable in the current address space, for
    ///   at least `size_of::<T>()` bytes.
    /// - The bytes must be valid for `T`, and the caller must not create
    ///   aliasing references to the same memory.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T;

    /// Byte view of the physical range `[pa, pa + len)`.
    ///
    /// # Safety
    /// Same contract as [`phys_to_mut`](Self::phys_to_mut), for the whole
    /// range, which must additionally be physically contiguous in the
    /// mapper's view.
    unsafe fn phys_to_slice_mut<'a>(&self, pa: PhysAddr, len: usize) -> &'a mut [u8] {
        let first: &'a mut u8 = unsafe { self.phys_to_mut(pa) };
        unsafe { core::slice::from_raw_parts_mut(core::ptr::from_mut(first), len) }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// [`PhysMapper`] for the running kernel: physical address `pa` is visible
/// at `DIRECT_MAP_BASE + pa` once the boot-time direct map is in place.
pub struct DirectPhysMapper;

impl PhysMapper for DirectPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        let va = phys_to_virt(pa.as_u64()) as *mut T;
        // SAFETY: the caller guarantees the direct map covers `pa`.
        unsafe { &mut *va }
    }
}
