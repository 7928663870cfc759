// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Fake implementations of system register getters and setters for unit
//! tests and host harnesses.

use super::{CcsidrEl1, ClidrEl1, CsselrEl1, MpidrEl1};
use spin::mutex::SpinMutex;

/// Values of fake system registers.
pub static SYSREGS: SpinMutex<SystemRegisters> = SpinMutex::new(SystemRegisters::new());

/// A set of fake system registers.
///
/// `ccsidr_el1` is modelled per cache selection: reads return the slot named
/// by the last `csselr_el1` write, mirroring the select-then-read protocol of
/// the hardware.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SystemRegisters {
    /// Fake value for the CLIDR_EL1 system register.
    pub clidr_el1: ClidrEl1,
    /// Fake value for the CSSELR_EL1 system register.
    pub csselr_el1: CsselrEl1,
    /// Fake values for the CCSIDR_EL1 system register, indexed by CSSELR.
    pub ccsidr_el1: [CcsidrEl1; 16],
    /// Fake value for the MPIDR_EL1 system register.
    pub mpidr_el1: MpidrEl1,
}

impl SystemRegisters {
    const fn new() -> Self {
        Self {
            clidr_el1: ClidrEl1(0),
            csselr_el1: CsselrEl1(0),
            ccsidr_el1: [CcsidrEl1(0); 16],
            mpidr_el1: MpidrEl1(0),
        }
    }

    /// Resets the fake system registers to their initial state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Installs a data or unified cache geometry at `level`.
    pub fn set_data_cache(&mut self, level: usize, line_size: u64, associativity: u64, sets: u64) {
        self.ccsidr_el1[CsselrEl1::data(level).0 as usize] =
            CcsidrEl1::from_geometry(line_size, associativity, sets);
    }

    /// Installs an instruction cache geometry at `level`.
    pub fn set_instruction_cache(
        &mut self,
        level: usize,
        line_size: u64,
        associativity: u64,
        sets: u64,
    ) {
        self.ccsidr_el1[CsselrEl1::instruction(level).0 as usize] =
            CcsidrEl1::from_geometry(line_size, associativity, sets);
    }
}

/// Returns the value of the fake `clidr_el1` system register.
pub fn read_clidr_el1() -> ClidrEl1 {
    SYSREGS.lock().clidr_el1
}

/// Writes `value` to the fake `csselr_el1` system register.
pub fn write_csselr_el1(value: CsselrEl1) {
    SYSREGS.lock().csselr_el1 = value;
}

/// Returns the fake `ccsidr_el1` value selected by the last CSSELR write.
pub fn read_ccsidr_el1() -> CcsidrEl1 {
    let sysregs = SYSREGS.lock();
    sysregs.ccsidr_el1[(sysregs.csselr_el1.0 & 0xf) as usize]
}

/// Returns the value of the fake `mpidr_el1` system register.
pub fn read_mpidr_el1() -> MpidrEl1 {
    SYSREGS.lock().mpidr_el1
}
