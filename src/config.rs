// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Memory-region descriptors as declared in cell configurations.

use crate::platform::PAGE_SIZE;
use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

bitflags! {
    /// Memory-region flags, shared between ordinary and colored regions.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MemFlags: u64 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
        /// DMA-capable device memory.
        const DMA = 1 << 3;
        /// I/O region.
        const IO = 1 << 4;
        /// Communication region shared with the root cell.
        const COMM_REGION = 1 << 5;
        /// The root cell loads the inmate image into this region.
        const LOADABLE = 1 << 6;
        /// Remains mapped in the root cell while the cell runs.
        const ROOTSHARED = 1 << 7;
        /// Never map with block descriptors.
        const NO_HUGEPAGES = 1 << 8;
        /// Marks the single root-level pool that backs managed colored
        /// allocations.
        const COLORED = 1 << 9;
        /// Managed colored allocation for a non-root cell.
        const COLORED_CELL = 1 << 10;
        /// Unaligned I/O access allowed.
        const IO_UNALIGNED = 1 << 15;
        /// 8-bit I/O access width.
        const IO_8 = 1 << 16;
        /// 16-bit I/O access width.
        const IO_16 = 2 << 16;
        /// 32-bit I/O access width.
        const IO_32 = 4 << 16;
        /// 64-bit I/O access width.
        const IO_64 = 8 << 16;
    }
}

/// An ordinary memory region of a cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Host-physical base address.
    pub phys_start: u64,
    /// Guest-virtual base address.
    pub virt_start: u64,
    /// Size in bytes, a page multiple.
    pub size: u64,
    /// Access and type flags.
    pub flags: MemFlags,
}

impl MemoryRegion {
    /// One past the last physical address of the region.
    pub fn phys_end(&self) -> u64 {
        self.phys_start + self.size
    }

    /// Whether `addr` falls inside the physical extent of the region.
    pub fn contains_phys(&self, addr: u64) -> bool {
        (self.phys_start..self.phys_end()).contains(&addr)
    }
}

/// A colored memory region of a cell.
///
/// The guest sees the contiguous virtual range of `memory`; physically the
/// region is striped over the page frames whose color index is a set bit of
/// `colors`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ColoredRegion {
    /// The underlying region. In managed mode `phys_start` is zero until the
    /// validator fills in the root pool base.
    pub memory: MemoryRegion,
    /// Bitmap of assigned colors; bit `k` selects color `k`.
    pub colors: u64,
    /// Constant added to every produced physical fragment address, for
    /// physical pools living away from the naive color walk.
    pub rebase_offset: u64,
}

impl ColoredRegion {
    /// Whether the physical placement is chosen by the subsystem rather than
    /// the configuration.
    pub fn is_managed(&self) -> bool {
        self.memory.phys_start == 0
    }
}

/// Serialized colored-region descriptor, as stored in cell configurations.
#[derive(
    Clone, Copy, Debug, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq,
)]
#[repr(C)]
pub struct ColoredRegionDesc {
    /// Host-physical base address; zero selects managed mode.
    pub phys_start: u64,
    /// Guest-virtual base address.
    pub virt_start: u64,
    /// Size in bytes.
    pub size: u64,
    /// Raw [`MemFlags`] bits.
    pub flags: u64,
    /// Bitmap of assigned colors.
    pub colors: u64,
    /// Constant added to every produced physical fragment address.
    pub rebase_offset: u64,
}

impl From<ColoredRegionDesc> for ColoredRegion {
    fn from(desc: ColoredRegionDesc) -> Self {
        Self {
            memory: MemoryRegion {
                phys_start: desc.phys_start,
                virt_start: desc.virt_start,
                size: desc.size,
                flags: MemFlags::from_bits_retain(desc.flags),
            },
            colors: desc.colors,
            rebase_offset: desc.rebase_offset,
        }
    }
}

impl From<ColoredRegion> for ColoredRegionDesc {
    fn from(region: ColoredRegion) -> Self {
        Self {
            phys_start: region.memory.phys_start,
            virt_start: region.memory.virt_start,
            size: region.memory.size,
            flags: region.memory.flags.bits(),
            colors: region.colors,
            rebase_offset: region.rebase_offset,
        }
    }
}

/// Borrows the colored-region descriptor table out of a configuration blob.
///
/// Returns `None` when the byte length is not a whole number of descriptors.
pub fn colored_region_table(bytes: &[u8]) -> Option<&[ColoredRegionDesc]> {
    <[ColoredRegionDesc]>::ref_from_bytes(bytes).ok()
}

/// Returns whether `size` is a whole number of pages.
pub fn is_page_multiple(size: u64) -> bool {
    size % PAGE_SIZE == 0
}
