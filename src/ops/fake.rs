// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A fake [`MemoryInterface`] for unit tests and host harnesses.
//!
//! Models the collaborating subsystems closely enough to check the
//! interesting properties: per-cell stage-2 and SMMU tables, the root
//! cell's table, the hypervisor's own stage-1 mappings, a bounded page
//! pool, the stop-the-world barrier, and byte-accurate physical memory so
//! the recoloring copies can be verified end to end.

use super::{FailureMode, MemoryInterface, PagingOpts};
use crate::{
    Error, Result,
    aarch64::DcacheOp,
    cell::Cell,
    config::MemFlags,
    fragment::Fragment,
    platform::PAGE_SIZE,
};
use std::collections::BTreeMap;

const PAGE: usize = PAGE_SIZE as usize;

/// Attributes the root cell maps its RAM with.
const ROOT_RAM_FLAGS: MemFlags = MemFlags::READ.union(MemFlags::WRITE);

/// One installed page mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageMapping {
    /// Mapped physical page frame.
    pub phys: u64,
    /// Flags the mapping was installed with.
    pub flags: MemFlags,
}

/// All page tables of the fake, snapshottable for round-trip checks.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tables {
    /// Per-cell stage-2 mappings, keyed by (cell, virtual page).
    pub cell_maps: BTreeMap<(u32, u64), PageMapping>,
    /// Registered sub-page fragments, keyed by (cell, virtual address).
    pub subpages: BTreeMap<(u32, u64), PageMapping>,
    /// Per-cell SMMU mappings, keyed by (cell, virtual page).
    pub smmu_maps: BTreeMap<(u32, u64), PageMapping>,
    /// The root cell's stage-2 mappings, keyed by virtual page.
    pub root_maps: BTreeMap<u64, PageMapping>,
    /// The hypervisor's stage-1 mappings, virtual page to physical page.
    pub hv_maps: BTreeMap<u64, u64>,
}

/// A fake memory backend for unit tests.
pub struct FakeMemory {
    /// Installed page tables.
    pub tables: Tables,
    /// Whether an SMMU backend is present.
    pub smmu_present: bool,
    /// Simulated physical memory, one entry per touched page frame.
    pub mem: BTreeMap<u64, Box<[u8; PAGE]>>,
    /// Pages available to `alloc_pool_pages`.
    pub pool_capacity: usize,
    /// Pages currently reserved from the pool.
    pub pool_used: usize,
    /// Whether other CPUs are currently parked.
    pub parked: bool,
    /// Number of completed park/release cycles.
    pub park_cycles: u32,
    /// Recorded D-cache flushes.
    pub flushes: Vec<(u64, u64, DcacheOp)>,
}

impl Default for FakeMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMemory {
    /// Creates a fake with an SMMU backend and a roomy pool.
    pub fn new() -> Self {
        Self {
            tables: Tables::default(),
            smmu_present: true,
            mem: BTreeMap::new(),
            pool_capacity: 1024,
            pool_used: 0,
            parked: false,
            park_cycles: 0,
            flushes: Vec::new(),
        }
    }

    /// Identity-maps `[phys, phys + size)` into the root cell, the state a
    /// freshly booted root OS is in.
    pub fn add_root_ram(&mut self, phys: u64, size: u64) {
        for page in pages(phys, size) {
            self.tables.root_maps.insert(
                page,
                PageMapping {
                    phys: page,
                    flags: ROOT_RAM_FLAGS,
                },
            );
        }
    }

    /// Writes `bytes` into simulated physical memory at `phys`.
    pub fn write_phys(&mut self, phys: u64, bytes: &[u8]) {
        for (index, &byte) in bytes.iter().enumerate() {
            let addr = phys + index as u64;
            self.page_mut(addr & !(PAGE_SIZE - 1))[(addr % PAGE_SIZE) as usize] = byte;
        }
    }

    /// Reads one byte of simulated physical memory.
    pub fn read_phys(&mut self, phys: u64) -> u8 {
        self.page_mut(phys & !(PAGE_SIZE - 1))[(phys % PAGE_SIZE) as usize]
    }

    /// Returns the physical frame the cell's stage-2 maps at `virt`.
    pub fn cell_mapping(&self, cell: u32, virt: u64) -> Option<u64> {
        self.tables.cell_maps.get(&(cell, virt)).map(|m| m.phys)
    }

    /// Returns the physical frame the cell's SMMU table maps at `virt`.
    pub fn smmu_mapping(&self, cell: u32, virt: u64) -> Option<u64> {
        self.tables.smmu_maps.get(&(cell, virt)).map(|m| m.phys)
    }

    /// Returns the root cell's mapping of physical frame `phys`, if any.
    pub fn root_mapping(&self, phys: u64) -> Option<u64> {
        self.tables
            .root_maps
            .iter()
            .find(|(_, m)| m.phys == phys)
            .map(|(&virt, _)| virt)
    }

    /// Returns the physical frame the root cell maps at `virt`.
    pub fn root_mapping_at_virt(&self, virt: u64) -> Option<u64> {
        self.tables.root_maps.get(&virt).map(|m| m.phys)
    }

    /// Returns the physical frame the hypervisor maps at `virt`.
    pub fn hv_mapping(&self, virt: u64) -> Option<u64> {
        self.tables.hv_maps.get(&virt).copied()
    }

    /// Snapshot of every table, for bitwise round-trip comparisons.
    pub fn snapshot_tables(&self) -> Tables {
        self.tables.clone()
    }

    fn page_mut(&mut self, page: u64) -> &mut [u8; PAGE] {
        debug_assert_eq!(page % PAGE_SIZE, 0);
        self.mem.entry(page).or_insert_with(|| Box::new([0; PAGE]))
    }

    /// Translates a hypervisor virtual address through `hv_maps`.
    fn resolve_hv(&self, va: u64) -> u64 {
        let page = va & !(PAGE_SIZE - 1);
        let phys = self
            .tables
            .hv_maps
            .get(&page)
            .unwrap_or_else(|| panic!("access through unmapped HV address {va:#x}"));
        phys + (va - page)
    }
}

fn pages(start: u64, size: u64) -> impl Iterator<Item = u64> {
    debug_assert_eq!(start % PAGE_SIZE, 0);
    debug_assert_eq!(size % PAGE_SIZE, 0);
    (start..start + size).step_by(PAGE)
}

impl MemoryInterface for FakeMemory {
    fn map(&mut self, cell: &Cell, frag: &Fragment) -> Result<()> {
        for (index, page) in pages(frag.virt_start, frag.size).enumerate() {
            let mapping = PageMapping {
                phys: frag.phys_start + index as u64 * PAGE_SIZE,
                flags: frag.flags,
            };
            if self
                .tables
                .cell_maps
                .insert((cell.id.0, page), mapping)
                .is_some()
            {
                panic!("double stage-2 mapping for cell {} at {page:#x}", cell.id.0);
            }
        }
        Ok(())
    }

    fn unmap(&mut self, cell: &Cell, frag: &Fragment) -> Result<()> {
        for page in pages(frag.virt_start, frag.size) {
            self.tables.cell_maps.remove(&(cell.id.0, page));
        }
        Ok(())
    }

    fn map_subpage(&mut self, cell: &Cell, frag: &Fragment) -> Result<()> {
        self.tables.subpages.insert(
            (cell.id.0, frag.virt_start),
            PageMapping {
                phys: frag.phys_start,
                flags: frag.flags,
            },
        );
        Ok(())
    }

    fn unmap_from_root(&mut self, frag: &Fragment) -> Result<()> {
        for page in pages(frag.virt_start, frag.size) {
            if self.tables.root_maps.remove(&page).is_none() {
                return Err(Error::RootConflict);
            }
        }
        Ok(())
    }

    fn remap_to_root(&mut self, frag: &Fragment, _mode: FailureMode) -> Result<()> {
        // First detect conflicts, then commit, so a refused remap leaves the
        // tables untouched. The real hook derives the attributes from the
        // root's own region descriptors, so the fragment flags are ignored.
        for (index, page) in pages(frag.virt_start, frag.size).enumerate() {
            let phys = frag.phys_start + index as u64 * PAGE_SIZE;
            if let Some(existing) = self.tables.root_maps.get(&page)
                && existing.phys != phys
            {
                return Err(Error::RootConflict);
            }
        }
        for (index, page) in pages(frag.virt_start, frag.size).enumerate() {
            self.tables.root_maps.insert(
                page,
                PageMapping {
                    phys: frag.phys_start + index as u64 * PAGE_SIZE,
                    flags: ROOT_RAM_FLAGS,
                },
            );
        }
        Ok(())
    }

    fn smmu_map(&mut self, cell: &Cell, frag: &Fragment) -> Result<()> {
        if !self.smmu_present {
            return Err(Error::NotSupported);
        }
        for (index, page) in pages(frag.virt_start, frag.size).enumerate() {
            self.tables.smmu_maps.insert(
                (cell.id.0, page),
                PageMapping {
                    phys: frag.phys_start + index as u64 * PAGE_SIZE,
                    flags: frag.flags,
                },
            );
        }
        Ok(())
    }

    fn smmu_unmap(&mut self, cell: &Cell, frag: &Fragment) -> Result<()> {
        if !self.smmu_present {
            return Err(Error::NotSupported);
        }
        for page in pages(frag.virt_start, frag.size) {
            self.tables.smmu_maps.remove(&(cell.id.0, page));
        }
        Ok(())
    }

    fn paging_create(
        &mut self,
        phys: u64,
        size: u64,
        virt: u64,
        _flags: MemFlags,
        _opts: PagingOpts,
    ) -> Result<()> {
        for (index, page) in pages(virt, size).enumerate() {
            self.tables
                .hv_maps
                .insert(page, phys + index as u64 * PAGE_SIZE);
        }
        Ok(())
    }

    fn paging_destroy(&mut self, virt: u64, size: u64, _opts: PagingOpts) -> Result<()> {
        for page in pages(virt, size) {
            self.tables.hv_maps.remove(&page);
        }
        Ok(())
    }

    fn copy_page(&mut self, dst_va: u64, src_va: u64) {
        let src = self.resolve_hv(src_va);
        let dst = self.resolve_hv(dst_va);
        let data = *self.page_mut(src);
        *self.page_mut(dst) = data;
    }

    fn dcache_flush_by_va(&mut self, va: u64, size: u64, op: DcacheOp) {
        self.flushes.push((va, size, op));
    }

    fn alloc_pool_pages(&mut self, count: usize) -> Result<u64> {
        if self.pool_used + count > self.pool_capacity {
            return Err(Error::OutOfMemory);
        }
        let addr = 0xF000_0000 + self.pool_used as u64 * PAGE_SIZE;
        self.pool_used += count;
        Ok(addr)
    }

    fn free_pool_pages(&mut self, _addr: u64, count: usize) {
        self.pool_used = self.pool_used.saturating_sub(count);
    }

    fn park_other_cpus(&mut self) {
        assert!(!self.parked, "park_other_cpus while already parked");
        self.parked = true;
    }

    fn release_cpus(&mut self) {
        assert!(self.parked, "release_cpus without parking");
        self.parked = false;
        self.park_cycles += 1;
    }
}
