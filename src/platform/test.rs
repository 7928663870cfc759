// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Constants for host builds and unit tests.

use percore::Cores;

/// The number of CPU cores.
pub const CORE_COUNT: usize = 4;

/// Linear core index provider.
pub struct CoresImpl;

// SAFETY: Unit tests run on the host where there is no MPIDR to read; core
// zero is the only core this fake ever reports, so indices never collide.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        0
    }
}
