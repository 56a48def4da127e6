//! TLB and CR3 plumbing.
//!
//! Compiled to no-ops off x86-64 so the crate's logic stays testable on a
//! development host.

use crate::addresses::{PhysAddr, VirtAddr};

/// Drop any cached translation for the page at `va`.
///
/// # Safety
/// Only meaningful (and only safe) when the address space being changed is
/// the one currently loaded; the caller checks that before flushing.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn invalidate_page(va: VirtAddr) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) unsafe fn invalidate_page(_va: VirtAddr) {}

/// Load `root` into CR3, switching the active address space and flushing all
/// non-global TLB entries.
///
/// # Safety
/// `root` must be the frame of a PML4 whose mappings keep the currently
/// executing code, stack, and data reachable.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn load_root(root: PhysAddr) {
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) unsafe fn load_root(_root: PhysAddr) {}
