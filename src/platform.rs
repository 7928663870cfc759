// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build-time platform constants.
//!
//! The hypervisor build selects a platform with `--cfg platform="<name>"`;
//! host builds (and unit tests) fall back to the test platform.

#[cfg(platform = "fvp")]
mod fvp;
#[cfg(platform = "fvp")]
pub use fvp::{CORE_COUNT, CoresImpl};

#[cfg(platform = "qemu")]
mod qemu;
#[cfg(platform = "qemu")]
pub use qemu::{CORE_COUNT, CoresImpl};

#[cfg(not(any(platform = "fvp", platform = "qemu")))]
mod test;
#[cfg(not(any(platform = "fvp", platform = "qemu")))]
pub use test::{CORE_COUNT, CoresImpl};

use percore::Cores;

/// Size in bytes of the translation granule.
pub const PAGE_SIZE: u64 = 0x1000;

/// Log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();

/// Mask clearing the offset bits within a page.
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Virtual offset of the loader and recoloring mappings.
///
/// Chosen so that rebased mappings never collide with ordinary cell memory;
/// nothing real may live at these guest-physical addresses.
pub const ROOT_MAP_OFFSET: u64 = 0xC0_0000_0000;

/// Base virtual address of the per-CPU temporary mapping windows in the
/// hypervisor's own address space.
pub const TEMPORARY_MAPPING_BASE: u64 = 0x80_0000_0000;

/// Number of pages in one CPU's temporary mapping window.
pub const NUM_TEMPORARY_PAGES: u64 = 16;

/// Returns the base of the calling CPU's temporary mapping window.
///
/// The window belongs exclusively to this CPU and must never be handed to
/// another one.
pub fn temporary_mapping_base() -> u64 {
    TEMPORARY_MAPPING_BASE + CoresImpl::core_index() as u64 * NUM_TEMPORARY_PAGES * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_constants_are_coherent() {
        assert!(PAGE_SIZE.is_power_of_two());
        assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);
        assert_eq!(PAGE_MASK & (PAGE_SIZE - 1), 0);
    }

    #[test]
    fn temporary_window_is_core_zero_in_tests() {
        assert_eq!(temporary_mapping_base(), TEMPORARY_MAPPING_BASE);
    }
}
