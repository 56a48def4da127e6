//! Page-table entries and the 512-entry tables that hold them.

use crate::addresses::PhysAddr;
use bitfield_struct::bitfield;

/// Entries per table at every level (PML4, PDPT, PD, PT).
pub const PAGE_TABLE_ENTRIES: usize = 512;

bitflags::bitflags! {
    /// Caller-facing mapping flags.
    ///
    /// These occupy the low architectural flag bits of a page-table entry,
    /// so composing an entry is `frame | flags`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFlags: u64 {
        /// Entry is valid; translation through it succeeds.
        const PRESENT = 1 << 0;
        /// Writes allowed (otherwise read-only).
        const WRITABLE = 1 << 1;
        /// Accessible from user mode (CPL 3).
        const USER = 1 << 2;
        /// Write-through caching; writes propagate to memory immediately.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled; required for device registers.
        const CACHE_DISABLE = 1 << 4;

        /// Standard kernel mapping: present and writable.
        const DEFAULT = Self::PRESENT.bits() | Self::WRITABLE.bits();
        /// Memory-mapped I/O: uncached, write-through.
        const MMIO = Self::DEFAULT.bits()
            | Self::CACHE_DISABLE.bits()
            | Self::WRITE_THROUGH.bits();
        /// User-mode mapping.
        const USERMODE = Self::DEFAULT.bits() | Self::USER.bits();

        /// Flags for links to intermediate tables. Intermediate entries stay
        /// permissive (user-visible, writable); the leaf entry is what
        /// actually restricts access, since x86 intersects permissions
        /// across the walk.
        const TABLE = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();
    }
}

/// One 64-bit x86-64 page-table entry.
///
/// The same layout serves all four levels: low flag bits, a 40-bit frame
/// address in bits 51:12, and NX at the top. Bit 7 is PS on PDPT/PD entries
/// (unused here — this subsystem maps 4 KiB pages only) and PAT on PT
/// entries.
#[bitfield(u64)]
pub struct PageTableEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User/supervisor (bit 2).
    pub user: bool,
    /// Page write-through (bit 3).
    pub write_through: bool,
    /// Page cache disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5); set by the CPU on first access.
    pub accessed: bool,
    /// Dirty (bit 6); set by the CPU on first write through a leaf.
    pub dirty: bool,
    /// Page size / PAT (bit 7).
    pub page_size: bool,
    /// Global (bit 8); leaf TLB entries survive CR3 reloads.
    pub global: bool,
    /// OS-available (bits 11:9).
    #[bits(3)]
    pub os_available_low: u8,
    /// Frame address bits 51:12.
    #[bits(40)]
    frame_51_12: u64,
    /// OS-available (bits 58:52).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection key / OS use (bits 62:59).
    #[bits(4)]
    pub protection_key: u8,
    /// No-execute (bit 63).
    pub no_execute: bool,
}

impl PageTableEntry {
    const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// Build an entry from a frame address and flags. The address is masked
    /// to its frame boundary, so stray offset bits never leak into the flag
    /// field.
    #[inline]
    #[must_use]
    pub const fn compose(frame: PhysAddr, flags: PageFlags) -> Self {
        Self::from_bits((frame.as_u64() & Self::FRAME_MASK) | flags.bits())
    }

    /// The frame this entry points at (flag bits stripped).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.into_bits() & Self::FRAME_MASK)
    }

    /// The caller-facing flag bits of this entry.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.into_bits())
    }

    /// Whether the entry is entirely clear.
    #[inline]
    #[must_use]
    pub const fn is_unused(self) -> bool {
        self.into_bits() == 0
    }
}

/// A 4 KiB-aligned table of 512 entries, one level of the radix tree.
///
/// Tables are never constructed by value; they are viewed in place inside a
/// physical frame through a [`PhysMapper`](crate::PhysMapper).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    /// Clear every entry. Freshly allocated table frames must be zeroed
    /// before any entry is written, or stale bytes would be interpreted as
    /// valid mappings.
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            *entry = PageTableEntry::new();
        }
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub fn set_entry(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub fn clear_entry(&mut self, index: usize) {
        self.entries[index] = PageTableEntry::new();
    }

    /// Whether every entry is clear; an empty table can be reclaimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| entry.is_unused())
    }
}
