// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Constants for the QEMU aarch64 virt platform.

use crate::sysregs::read_mpidr_el1;
use percore::Cores;

/// The number of CPU cores.
pub const CORE_COUNT: usize = 8;

/// Linear core index provider.
pub struct CoresImpl;

// SAFETY: QEMU virt assigns each core a unique Aff0 value in 0..CORE_COUNT,
// so no two cores ever observe the same index.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        read_mpidr_el1().aff0() as usize
    }
}
