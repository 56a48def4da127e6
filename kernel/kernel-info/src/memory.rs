//! # Memory Layout
//!
//! Fixed constants of the kernel's physical and virtual memory layout.

/// Size of one physical frame / virtual page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Base of the higher-half direct map: physical address `pa` is visible to
/// the kernel at `DIRECT_MAP_BASE + pa`.
pub const DIRECT_MAP_BASE: u64 = 0xffff_8000_0000_0000;

/// Upper bound on how much physical memory the boot-time direct map covers.
/// Machines with less memory get a map sized to their physical limit.
pub const DIRECT_MAP_WINDOW: u64 = 4 * 1024 * 1024 * 1024;

/// Legacy low memory (real-mode IVT, EBDA, VGA holes). Frames below this
/// boundary are never handed to the allocator.
pub const LOW_MEMORY_BOUNDARY: u64 = 0x10_0000;

/// Number of pages needed to hold `bytes`, rounding up.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Direct-map view of a physical address.
#[inline]
#[must_use]
pub const fn phys_to_virt(pa: u64) -> u64 {
    DIRECT_MAP_BASE + pa
}

/// Physical address behind a direct-map virtual address.
#[inline]
#[must_use]
pub const fn virt_to_phys(va: u64) -> u64 {
    va - DIRECT_MAP_BASE
}

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(DIRECT_MAP_BASE % PAGE_SIZE == 0);
    assert!(DIRECT_MAP_WINDOW % PAGE_SIZE == 0);
    assert!(LOW_MEMORY_BOUNDARY % PAGE_SIZE == 0);
};
