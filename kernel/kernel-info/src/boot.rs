//! # Boot-Loader Handoff Records
//!
//! Everything here is `#[repr(C)]` with fixed-size integers: these records
//! are produced on the boot-loader side of the ABI boundary and consumed
//! once by the kernel during early init.

use core::fmt;

/// Classification of one physical memory region, as reported by the boot
/// loader. Discriminants match the Limine memory-map type codes.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free conventional memory, guaranteed 4 KiB aligned.
    Usable = 0,
    /// Firmware-reserved; must never be mapped or allocated.
    Reserved = 1,
    /// Holds ACPI tables; reclaimable once they have been parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage; must be preserved across sleep states.
    AcpiNvs = 3,
    /// Known-faulty memory.
    BadMemory = 4,
    /// Boot-loader structures; reclaimable once the kernel owns the machine.
    BootloaderReclaimable = 5,
    /// The kernel image and any loaded modules.
    KernelAndModules = 6,
    /// The linear framebuffer.
    Framebuffer = 7,
}

impl MemoryRegionKind {
    /// Kinds whose bytes count towards the allocator's total-size accounting.
    #[inline]
    #[must_use]
    pub const fn is_countable(self) -> bool {
        matches!(
            self,
            Self::Usable | Self::BootloaderReclaimable | Self::AcpiReclaimable
        )
    }

    /// Kinds that raise the highest tracked physical address.
    #[inline]
    #[must_use]
    pub const fn raises_physical_limit(self) -> bool {
        self.is_countable() || matches!(self, Self::KernelAndModules)
    }
}

impl fmt::Display for MemoryRegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "ACPI reclaimable",
            Self::AcpiNvs => "ACPI NVS",
            Self::BadMemory => "bad memory",
            Self::BootloaderReclaimable => "bootloader reclaimable",
            Self::KernelAndModules => "kernel and modules",
            Self::Framebuffer => "framebuffer",
        };
        f.write_str(name)
    }
}

/// One entry of the firmware memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MemoryMapEntry {
    /// Physical base address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// What the region holds.
    pub kind: MemoryRegionKind,
}

impl MemoryMapEntry {
    /// Exclusive physical end address of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// Where the boot loader placed the kernel image.
///
/// The kernel is linked against `virtual_base` but loaded at `physical_base`;
/// mapping an image page means translating `phys` to
/// `virtual_base + (phys - physical_base)`.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct KernelAddressInfo {
    /// Physical address the image was loaded at.
    pub physical_base: u64,
    /// Link-time virtual address of the image.
    pub virtual_base: u64,
}
