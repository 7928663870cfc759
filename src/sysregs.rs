// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Access to the CPU system registers used by the coloring subsystem.
//!
//! Only the cache-identification registers and `MPIDR_EL1` are needed here;
//! everything else the hypervisor touches lives with its owner.

#[cfg(any(test, feature = "fakes", not(target_arch = "aarch64")))]
pub mod fake;

/// Cache type as reported by a `CLIDR_EL1` Ctype field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CacheType {
    /// No cache at this level.
    NoCache = 0b000,
    /// Instruction cache only.
    InstructionOnly = 0b001,
    /// Data cache only.
    DataOnly = 0b010,
    /// Separate instruction and data caches.
    SeparateInstructionAndData = 0b011,
    /// Unified cache.
    Unified = 0b100,
}

impl TryFrom<u64> for CacheType {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0b000 => Self::NoCache,
            0b001 => Self::InstructionOnly,
            0b010 => Self::DataOnly,
            0b011 => Self::SeparateInstructionAndData,
            0b100 => Self::Unified,
            _ => return Err(()),
        })
    }
}

/// CLIDR_EL1 system register value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct ClidrEl1(pub u64);

impl ClidrEl1 {
    const CTYPE_BITS: u32 = 3;
    const CTYPE_MASK: u64 = 0b111;

    /// Returns the cache type at `level` (1-based, up to 7).
    ///
    /// Reserved Ctype encodings are reported as [`CacheType::NoCache`].
    pub fn ctype(self, level: usize) -> CacheType {
        debug_assert!((1..=7).contains(&level));
        let shift = Self::CTYPE_BITS * (level as u32 - 1);
        CacheType::try_from((self.0 >> shift) & Self::CTYPE_MASK).unwrap_or(CacheType::NoCache)
    }

    /// Builds a CLIDR value from the cache type of each level, for tests.
    pub fn from_levels(levels: &[CacheType]) -> Self {
        let mut value = 0;
        for (index, &level) in levels.iter().enumerate() {
            value |= (level as u64) << (Self::CTYPE_BITS * index as u32);
        }
        Self(value)
    }
}

/// CSSELR_EL1 system register value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct CsselrEl1(pub u64);

impl CsselrEl1 {
    const LEVEL_SHIFT: u32 = 1;
    const IND: u64 = 1 << 0;

    /// Selects the data or unified cache at `level` (1-based).
    pub fn data(level: usize) -> Self {
        debug_assert!((1..=7).contains(&level));
        Self(((level as u64) - 1) << Self::LEVEL_SHIFT)
    }

    /// Selects the instruction cache at `level` (1-based).
    pub fn instruction(level: usize) -> Self {
        Self(Self::data(level).0 | Self::IND)
    }
}

/// CCSIDR_EL1 system register value, 32-bit format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct CcsidrEl1(pub u64);

impl CcsidrEl1 {
    const LINE_SIZE_MASK: u64 = 0b111;
    const ASSOC_SHIFT: u32 = 3;
    const ASSOC_MASK: u64 = 0x3ff;
    const SETS_SHIFT: u32 = 13;
    const SETS_MASK: u64 = 0x7fff;

    /// Cache line size in bytes.
    pub fn line_size(self) -> u64 {
        1 << (4 + (self.0 & Self::LINE_SIZE_MASK))
    }

    /// Associativity of the cache.
    pub fn associativity(self) -> u64 {
        ((self.0 >> Self::ASSOC_SHIFT) & Self::ASSOC_MASK) + 1
    }

    /// Number of sets in the cache.
    pub fn sets(self) -> u64 {
        ((self.0 >> Self::SETS_SHIFT) & Self::SETS_MASK) + 1
    }

    /// Encodes a CCSIDR value from a cache geometry, for tests.
    ///
    /// `line_size` must be a power of two of at least 16 bytes.
    pub fn from_geometry(line_size: u64, associativity: u64, sets: u64) -> Self {
        assert!(line_size.is_power_of_two() && line_size >= 16);
        Self(
            (line_size.trailing_zeros() as u64 - 4)
                | (associativity - 1) << Self::ASSOC_SHIFT
                | (sets - 1) << Self::SETS_SHIFT,
        )
    }
}

/// MPIDR_EL1 system register value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct MpidrEl1(pub u64);

impl MpidrEl1 {
    /// Returns the value of the Aff0 field.
    pub fn aff0(self) -> u8 {
        self.0 as u8
    }

    /// Returns the value of the Aff1 field.
    pub fn aff1(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Returns the value of the Aff2 field.
    pub fn aff2(self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Returns the value of the Aff3 field.
    pub fn aff3(self) -> u8 {
        (self.0 >> 32) as u8
    }
}

#[cfg(all(target_arch = "aarch64", not(test), not(feature = "fakes")))]
mod aarch64 {
    use super::*;
    use core::arch::asm;

    /// Returns the value of the `clidr_el1` system register.
    pub fn read_clidr_el1() -> ClidrEl1 {
        let value;
        // SAFETY: Reading the cache level ID register has no side effects.
        unsafe {
            asm!("mrs {value}, clidr_el1", options(nostack), value = out(reg) value);
        }
        ClidrEl1(value)
    }

    /// Writes `value` to the `csselr_el1` system register.
    ///
    /// An `isb` is required before the selected geometry becomes observable
    /// through `ccsidr_el1`.
    pub fn write_csselr_el1(value: CsselrEl1) {
        // SAFETY: The cache size selection register only routes subsequent
        // CCSIDR reads.
        unsafe {
            asm!("msr csselr_el1, {value}", options(nostack), value = in(reg) value.0);
        }
    }

    /// Returns the value of the `ccsidr_el1` system register.
    pub fn read_ccsidr_el1() -> CcsidrEl1 {
        let value;
        // SAFETY: Reading the cache size ID register has no side effects.
        unsafe {
            asm!("mrs {value}, ccsidr_el1", options(nostack), value = out(reg) value);
        }
        CcsidrEl1(value)
    }

    /// Returns the value of the `mpidr_el1` system register.
    pub fn read_mpidr_el1() -> MpidrEl1 {
        let value;
        // SAFETY: Reading the affinity register has no side effects.
        unsafe {
            asm!("mrs {value}, mpidr_el1", options(nostack), value = out(reg) value);
        }
        MpidrEl1(value)
    }
}

#[cfg(all(target_arch = "aarch64", not(test), not(feature = "fakes")))]
pub use aarch64::{read_ccsidr_el1, read_clidr_el1, read_mpidr_el1, write_csselr_el1};

#[cfg(any(test, feature = "fakes", not(target_arch = "aarch64")))]
pub use fake::{read_ccsidr_el1, read_clidr_el1, read_mpidr_el1, write_csselr_el1};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clidr_ctype_fields() {
        let clidr = ClidrEl1::from_levels(&[
            CacheType::SeparateInstructionAndData,
            CacheType::Unified,
        ]);
        assert_eq!(clidr.ctype(1), CacheType::SeparateInstructionAndData);
        assert_eq!(clidr.ctype(2), CacheType::Unified);
        assert_eq!(clidr.ctype(3), CacheType::NoCache);
        assert_eq!(clidr.ctype(7), CacheType::NoCache);
    }

    #[test]
    fn ccsidr_geometry_round_trip() {
        let ccsidr = CcsidrEl1::from_geometry(64, 16, 1024);
        assert_eq!(ccsidr.line_size(), 64);
        assert_eq!(ccsidr.associativity(), 16);
        assert_eq!(ccsidr.sets(), 1024);
    }

    #[test]
    fn csselr_encoding() {
        assert_eq!(CsselrEl1::data(1).0, 0);
        assert_eq!(CsselrEl1::data(3).0, 0b100);
        assert_eq!(CsselrEl1::instruction(1).0, 0b001);
    }

    #[test]
    fn mpidr_affinity_fields() {
        let mpidr = MpidrEl1(0x01_0000_0203);
        assert_eq!(mpidr.aff0(), 3);
        assert_eq!(mpidr.aff1(), 2);
        assert_eq!(mpidr.aff2(), 0);
        assert_eq!(mpidr.aff3(), 1);
    }
}
