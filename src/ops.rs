// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-fragment operations on colored regions.
//!
//! Every lifecycle event reduces to one operation applied to each fragment
//! of each colored region. The collaborating subsystems (stage-2 paging,
//! SMMU tables, root-cell bookkeeping, hypervisor paging, cache
//! maintenance, the page pool and the CPU parking barrier) are reached
//! through the [`MemoryInterface`] capability trait, implemented once per
//! backend.

#[cfg(any(test, feature = "fakes"))]
pub mod fake;

use crate::{
    Error, Result,
    aarch64::DcacheOp,
    cache::LlcGeometry,
    cell::Cell,
    config::{ColoredRegion, MemFlags},
    fragment::{Fragment, Fragments},
    platform::{NUM_TEMPORARY_PAGES, PAGE_SIZE, ROOT_MAP_OFFSET, temporary_mapping_base},
};
use bitflags::bitflags;
use log::{debug, warn};

/// Failure policy for returning frames to the root cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureMode {
    /// Any error aborts the enclosing operation.
    Abort,
    /// Conflicts are logged and skipped; the root must keep running.
    Warn,
}

bitflags! {
    /// Options for hypervisor-space mappings.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PagingOpts: u32 {
        /// Do not flush table entries to the point of coherency.
        const NON_COHERENT = 1 << 0;
        /// Never use block descriptors.
        const NO_HUGE = 1 << 1;
    }
}

/// Attributes of hypervisor-space scratch and linear mappings.
pub const HV_PAGE_FLAGS: MemFlags = MemFlags::READ.union(MemFlags::WRITE);

/// The operation applied to each fragment of a colored region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Steal the frames from the root cell and map them into the cell.
    Create,
    /// Unmap from the cell and return the frames to the root cell.
    Destroy,
    /// Tear down the loader mapping of loadable fragments.
    Start,
    /// Install the loader mapping so the root can write the inmate image.
    Load,
    /// Flush the D-cache over the fragment through the temporary window.
    Dcache(DcacheOp),
    /// Install the hypervisor's own linear view of the colored frames.
    HvCreate,
    /// Remove the hypervisor's linear view.
    HvDestroy,
    /// Mirror of `Create` in the cell's SMMU tables.
    SmmuCreate,
    /// Mirror of `Destroy` in the cell's SMMU tables.
    SmmuDestroy,
}

/// The collaborator operations the coloring core drives.
///
/// One implementation per backend; all methods run stop-the-world, so no
/// locking is required of implementors.
pub trait MemoryInterface {
    /// Inserts the fragment into the cell's stage-2 table.
    fn map(&mut self, cell: &Cell, frag: &Fragment) -> Result<()>;

    /// Removes the fragment from the cell's stage-2 table. Tolerates
    /// missing mappings.
    fn unmap(&mut self, cell: &Cell, frag: &Fragment) -> Result<()>;

    /// Registers a sub-page MMIO fragment.
    fn map_subpage(&mut self, cell: &Cell, frag: &Fragment) -> Result<()>;

    /// Steals the fragment's frames from the root cell, removing its
    /// mapping at the fragment's virtual address. Callers pass the
    /// [`root_view`](Fragment::root_view) or
    /// [`loader_view`](Fragment::loader_view) of the fragment. Failure is
    /// fatal to the enclosing operation.
    fn unmap_from_root(&mut self, frag: &Fragment) -> Result<()>;

    /// Returns the fragment's frames to the root cell, mapping them at the
    /// fragment's virtual address.
    fn remap_to_root(&mut self, frag: &Fragment, mode: FailureMode) -> Result<()>;

    /// Mirrors the fragment into the cell's SMMU table.
    fn smmu_map(&mut self, _cell: &Cell, _frag: &Fragment) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Removes the fragment from the cell's SMMU table.
    fn smmu_unmap(&mut self, _cell: &Cell, _frag: &Fragment) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Maps `[phys, phys + size)` at `virt` in the hypervisor's own address
    /// space. Remapping an already-mapped window replaces it.
    fn paging_create(
        &mut self,
        phys: u64,
        size: u64,
        virt: u64,
        flags: MemFlags,
        opts: PagingOpts,
    ) -> Result<()>;

    /// Unmaps `[virt, virt + size)` from the hypervisor's own address
    /// space. Tolerates missing mappings.
    fn paging_destroy(&mut self, virt: u64, size: u64, opts: PagingOpts) -> Result<()>;

    /// Copies one page between two mapped hypervisor virtual addresses.
    fn copy_page(&mut self, dst_va: u64, src_va: u64);

    /// Performs `op` over `[va, va + size)` by virtual address.
    fn dcache_flush_by_va(&mut self, va: u64, size: u64, op: DcacheOp);

    /// Reserves `count` pages of page-table node backing. Returns the base
    /// of the reservation.
    fn alloc_pool_pages(&mut self, count: usize) -> Result<u64>;

    /// Releases a reservation made by
    /// [`alloc_pool_pages`](Self::alloc_pool_pages).
    fn free_pool_pages(&mut self, addr: u64, count: usize);

    /// Parks every other CPU on the stop-the-world barrier.
    fn park_other_cpus(&mut self);

    /// Releases the parked CPUs.
    fn release_cpus(&mut self);
}

/// Applies `op` to every fragment of `region`, in ascending virtual order.
///
/// The first failing fragment aborts the walk; a half-applied `Create` is
/// cleaned up by running `Destroy` over the same region, which tolerates
/// missing mappings.
pub fn apply_region<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    cell: &Cell,
    region: &ColoredRegion,
    op: Operation,
) -> Result<()> {
    debug!(
        "colored op {op:?}: {:#x} -> {:#x} (size {:#x}, colors {:#x}) for cell {}",
        region.memory.phys_start,
        region.memory.virt_start,
        region.memory.size,
        region.colors,
        cell.id.0,
    );
    for frag in Fragments::new(region, geom) {
        apply_fragment(iface, cell, &frag, op)?;
    }
    Ok(())
}

fn apply_fragment<M: MemoryInterface>(
    iface: &mut M,
    cell: &Cell,
    frag: &Fragment,
    op: Operation,
) -> Result<()> {
    match op {
        Operation::Create => {
            if !frag
                .flags
                .intersects(MemFlags::COMM_REGION | MemFlags::ROOTSHARED)
            {
                iface.unmap_from_root(&frag.root_view())?;
            }
            if frag.is_subpage() {
                iface.map_subpage(cell, frag)
            } else {
                iface.map(cell, frag)
            }
        }
        Operation::Destroy => {
            if !frag.is_subpage() {
                iface.unmap(cell, frag)?;
            }
            if !frag
                .flags
                .intersects(MemFlags::COMM_REGION | MemFlags::ROOTSHARED)
            {
                match iface.remap_to_root(&frag.root_view(), FailureMode::Warn) {
                    Err(Error::RootConflict) => {
                        warn!(
                            "conflicting root mapping at {:#x}, leaving it in place",
                            frag.virt_start,
                        );
                    }
                    result => result?,
                }
            }
            Ok(())
        }
        Operation::Start => {
            if frag.flags.contains(MemFlags::LOADABLE) {
                iface.unmap_from_root(&frag.loader_view())?;
            }
            Ok(())
        }
        Operation::Load => {
            if frag.flags.contains(MemFlags::LOADABLE) {
                iface.remap_to_root(&frag.loader_view(), FailureMode::Abort)?;
            }
            Ok(())
        }
        Operation::Dcache(kind) => flush_fragment(iface, frag, kind),
        Operation::HvCreate => iface.paging_create(
            frag.phys_start,
            frag.size,
            frag.virt_start + ROOT_MAP_OFFSET,
            HV_PAGE_FLAGS,
            PagingOpts::NON_COHERENT,
        ),
        Operation::HvDestroy => iface.paging_destroy(
            frag.virt_start + ROOT_MAP_OFFSET,
            frag.size,
            PagingOpts::NON_COHERENT,
        ),
        Operation::SmmuCreate => iface.smmu_map(cell, frag),
        Operation::SmmuDestroy => iface.smmu_unmap(cell, frag),
    }
}

/// Flushes the fragment by sliding the per-CPU temporary window over its
/// physical range, at most [`NUM_TEMPORARY_PAGES`] pages at a time.
fn flush_fragment<M: MemoryInterface>(
    iface: &mut M,
    frag: &Fragment,
    kind: DcacheOp,
) -> Result<()> {
    let window = temporary_mapping_base();
    let mut addr = frag.phys_start;
    let mut remaining = frag.size;
    while remaining > 0 {
        let size = remaining.min(NUM_TEMPORARY_PAGES * PAGE_SIZE);
        // The window's table nodes are preallocated, so this cannot exhaust
        // the pool.
        iface.paging_create(
            addr,
            size,
            window,
            HV_PAGE_FLAGS,
            PagingOpts::NON_COHERENT | PagingOpts::NO_HUGE,
        )?;
        iface.dcache_flush_by_va(window, size, kind);
        addr += size;
        remaining -= size;
    }
    iface.paging_destroy(
        window,
        frag.size.min(NUM_TEMPORARY_PAGES * PAGE_SIZE),
        PagingOpts::NON_COHERENT | PagingOpts::NO_HUGE,
    )
}
