//! Thin `u64` newtypes for physical and virtual addresses.
//!
//! Carrying the address kind in the type prevents the classic mix-up where a
//! physical frame address is dereferenced directly or a virtual address is
//! written into a page-table entry.

use core::fmt;
use kernel_info::memory::PAGE_SIZE;

/// A physical memory address (RAM or MMIO).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address lies on a frame boundary.
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// The base of the frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// The address `pages` whole frames further on.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, pages: u64) -> Self {
        Self(self.0 + pages * PAGE_SIZE)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// A virtual memory address.
///
/// Only the low 48 bits participate in translation; the index accessors
/// extract the four 9-bit page-table indices from them.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// PML4 index (bits 47‒39).
    #[inline]
    #[must_use]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1ff) as usize
    }

    /// PDPT index (bits 38‒30).
    #[inline]
    #[must_use]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1ff) as usize
    }

    /// PD index (bits 29‒21).
    #[inline]
    #[must_use]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1ff) as usize
    }

    /// PT index (bits 20‒12).
    #[inline]
    #[must_use]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1ff) as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// The address `pages` whole pages further on.
    #[inline]
    #[must_use]
    pub const fn add_pages(self, pages: u64) -> Self {
        Self(self.0 + pages * PAGE_SIZE)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extraction() {
        // Direct-map base: bit 47 set, everything below clear.
        let va = VirtAddr::new(0xffff_8000_0000_0000);
        assert_eq!(va.pml4_index(), 256);
        assert_eq!(va.pdpt_index(), 0);
        assert_eq!(va.pd_index(), 0);
        assert_eq!(va.pt_index(), 0);

        let va = VirtAddr::new((511 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 0x123);
        assert_eq!(va.pml4_index(), 511);
        assert_eq!(va.pdpt_index(), 2);
        assert_eq!(va.pd_index(), 3);
        assert_eq!(va.pt_index(), 4);
    }

    #[test]
    fn page_arithmetic() {
        let pa = PhysAddr::new(0x10_0000);
        assert_eq!(pa.add_pages(3).as_u64(), 0x10_3000);
        assert!(pa.is_page_aligned());
        assert!(!PhysAddr::new(0x10_0008).is_page_aligned());
        assert_eq!(PhysAddr::new(0x10_0fff).frame_base(), pa);

        let va = VirtAddr::new(0xffff_8000_0000_0000);
        assert_eq!(va.add_pages(2).as_u64(), 0xffff_8000_0000_2000);
    }
}
