// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Constants for the Arm FVP Base platform.

use crate::sysregs::read_mpidr_el1;
use percore::Cores;

/// Cores per cluster on the FVP Base model.
const CORES_PER_CLUSTER: usize = 4;

/// Number of clusters.
const CLUSTER_COUNT: usize = 2;

/// The number of CPU cores.
pub const CORE_COUNT: usize = CLUSTER_COUNT * CORES_PER_CLUSTER;

/// Linear core index provider.
pub struct CoresImpl;

// SAFETY: The FVP encodes the cluster in Aff1 and the core in Aff0, both
// dense from zero, so the computed index is unique per core and below
// CORE_COUNT for every valid MPIDR.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        let mpidr = read_mpidr_el1();
        mpidr.aff1() as usize * CORES_PER_CLUSTER + mpidr.aff0() as usize
    }
}
