//! # Kernel Boot & Layout Information
//!
//! Data that crosses the boot-loader / kernel boundary, plus the fixed
//! virtual-memory layout constants the rest of the kernel builds on.
//!
//! The boot loader hands the kernel a physical memory map (an ordered list of
//! [`MemoryMapEntry`](boot::MemoryMapEntry) records) and the kernel's own
//! load-address pair ([`KernelAddressInfo`](boot::KernelAddressInfo)). Both
//! are read exactly once during early init and never re-queried; everything
//! the memory manager knows about physical memory topology comes from here.
//!
//! The [`memory`] module pins down the constants with bit-exact meaning:
//! the 4 KiB page size, the higher-half direct-map base, and the 1 MiB
//! legacy-memory boundary below which no frame is ever handed out.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
