//! # Kernel synchronization primitives
//!
//! A busy-waiting [`SpinLock`] is all the memory subsystem needs: its
//! critical sections are short, bounded loops (bitmap scans, fixed-depth
//! page-table walks) that never block or yield.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
