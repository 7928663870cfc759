// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Cell-level dispatch of colored-region operations.
//!
//! Every entry point here runs in the hypervisor, inside a cell-state-change
//! hypercall or the global enable/disable paths. The other CPUs are parked
//! on the stop-the-world barrier before any table is touched and released
//! only after the TLBs are invalidated.

use crate::{
    Error, Result,
    aarch64::{DcacheOp, dsb_ish, isb, tlbi_alle2, tlbi_vmalls12e1is},
    cache::LlcGeometry,
    cell::Cell,
    config::MemFlags,
    ops::{MemoryInterface, Operation, apply_region},
    platform::CORE_COUNT,
    recolor::{color_root_region, uncolor_root_region},
};
use log::{info, warn};
use spin::{Once, mutex::SpinMutex};

/// Geometry of the coloring target, probed once at hypervisor enable.
static GEOMETRY: Once<LlcGeometry> = Once::new();

/// Union of the color bitmaps managed cells currently hold against the root
/// pool.
static MANAGED_COLORS: SpinMutex<u64> = SpinMutex::new(0);

/// Pool reservation backing the per-CPU temporary windows: one leaf table
/// per window plus the shared upper levels.
const SCRATCH_POOL_PAGES: usize = CORE_COUNT + 3;

/// Base address of the scratch reservation, once made.
static SCRATCH_POOL: SpinMutex<Option<u64>> = SpinMutex::new(None);

/// Returns the probed LLC geometry, if coloring is active.
pub fn geometry() -> Option<&'static LlcGeometry> {
    GEOMETRY.get()
}

/// Returns the union of color bitmaps currently claimed against the root
/// pool, for the validator.
pub fn managed_colors() -> u64 {
    *MANAGED_COLORS.lock()
}

/// Brings the coloring subsystem up at hypervisor enable: probes the cache
/// hierarchy, reserves the temporary-window backing, recolors the root
/// cell's RAM in place and installs its colored mappings.
///
/// On failure everything is rewound: the root RAM is identity-mapped again
/// before the error is returned.
pub fn enable<M: MemoryInterface>(iface: &mut M, root: &Cell) -> Result<()> {
    let Some(probed) = LlcGeometry::probe() else {
        if root.colored_regions.is_empty() {
            info!("coloring disabled");
            return Ok(());
        }
        return Err(Error::ConfigInvalid(
            "colored region declared but no unified cache level found",
        ));
    };
    let geom = GEOMETRY.call_once(|| probed);

    let scratch = iface.alloc_pool_pages(SCRATCH_POOL_PAGES)?;
    *SCRATCH_POOL.lock() = Some(scratch);

    iface.park_other_cpus();
    let result = enable_root(iface, geom, root);
    invalidate_tlbs();
    iface.release_cpus();

    if result.is_err() {
        *SCRATCH_POOL.lock() = None;
        iface.free_pool_pages(scratch, SCRATCH_POOL_PAGES);
    }
    result
}

fn enable_root<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    root: &Cell,
) -> Result<()> {
    for (index, region) in root.colored_regions.iter().enumerate() {
        if let Err(err) = color_root_region(iface, geom, root, region) {
            warn!("recoloring failed: {err}, rewinding the root cell");
            rewind_root(iface, geom, root, index + 1);
            return Err(err);
        }
    }

    // Install the root's colored mappings only after the copies, to reduce
    // the likelihood of running out of pool pages while the colored mapping
    // is live.
    if let Err(err) = create_regions(iface, geom, root) {
        warn!("mapping the recolored root failed: {err}, rewinding");
        destroy_regions(iface, geom, root);
        rewind_root(iface, geom, root, root.colored_regions.len());
        return Err(err);
    }
    Ok(())
}

/// Copies the first `count` colored regions of the root back to the
/// identity layout, tolerating errors.
fn rewind_root<M: MemoryInterface>(iface: &mut M, geom: &LlcGeometry, root: &Cell, count: usize) {
    for region in root.colored_regions.iter().take(count) {
        if let Err(err) = uncolor_root_region(iface, geom, root, region) {
            warn!(
                "rewinding root RAM at {:#x} failed: {err}",
                region.memory.phys_start,
            );
        }
    }
}

/// Shuts the subsystem down: unmaps the root's colored regions, copies its
/// RAM back to the identity layout and returns the scratch reservation.
pub fn shutdown<M: MemoryInterface>(iface: &mut M, root: &Cell) {
    let Some(geom) = geometry() else {
        return;
    };

    iface.park_other_cpus();
    // Free the colored stage-2 mappings first, to take it easy on the pool
    // pages the recoloring mappings are about to need.
    destroy_regions(iface, geom, root);
    rewind_root(iface, geom, root, root.colored_regions.len());
    invalidate_tlbs();
    iface.release_cpus();

    if let Some(scratch) = SCRATCH_POOL.lock().take() {
        iface.free_pool_pages(scratch, SCRATCH_POOL_PAGES);
    }
}

/// Maps the colored regions of a new cell, stealing the frames from the
/// root. A partial failure is rolled back by destroying the same region
/// list before the error is returned.
pub fn cell_create<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    cell: &Cell,
) -> Result<()> {
    iface.park_other_cpus();
    let result = create_regions(iface, geom, cell);
    if result.is_err() {
        destroy_regions(iface, geom, cell);
    } else {
        *MANAGED_COLORS.lock() |= claimed_colors(cell);
    }
    invalidate_tlbs();
    iface.release_cpus();
    result
}

/// Unmaps the colored regions of a cell and returns the frames to the root.
/// Errors are logged but never stop the walk: shutdown always makes forward
/// progress.
pub fn cell_destroy<M: MemoryInterface>(iface: &mut M, geom: &LlcGeometry, cell: &Cell) {
    iface.park_other_cpus();
    flush_regions(iface, geom, cell, DcacheOp::Invalidate);
    destroy_regions(iface, geom, cell);
    *MANAGED_COLORS.lock() &= !claimed_colors(cell);
    invalidate_tlbs();
    iface.release_cpus();
}

/// Installs the loader mappings so the root can write the inmate images
/// into the colored frames.
pub fn cell_load<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    cell: &Cell,
) -> Result<()> {
    iface.park_other_cpus();
    let result = walk_regions(iface, geom, cell, Operation::Load);
    invalidate_tlbs();
    iface.release_cpus();
    result
}

/// Tears the loader mappings down and flushes the loaded images out of the
/// D-cache, just before the cell's CPUs are released.
pub fn cell_start<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    cell: &Cell,
) -> Result<()> {
    iface.park_other_cpus();
    let result = walk_regions(iface, geom, cell, Operation::Start).and_then(|()| {
        walk_regions(
            iface,
            geom,
            cell,
            Operation::Dcache(DcacheOp::CleanAndInvalidate),
        )
    });
    invalidate_tlbs();
    iface.release_cpus();
    result
}

/// Flushes every colored region of the cell.
pub fn cell_flush<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    cell: &Cell,
    kind: DcacheOp,
) -> Result<()> {
    walk_regions(iface, geom, cell, Operation::Dcache(kind))
}

fn walk_regions<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    cell: &Cell,
    op: Operation,
) -> Result<()> {
    for region in cell.colored_regions {
        apply_region(iface, geom, cell, region, op)?;
    }
    Ok(())
}

fn create_regions<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    cell: &Cell,
) -> Result<()> {
    for region in cell.colored_regions {
        apply_region(iface, geom, cell, region, Operation::Create)?;
        if cell.has_smmu_streams() {
            apply_region(iface, geom, cell, region, Operation::SmmuCreate)?;
        }
    }
    Ok(())
}

fn destroy_regions<M: MemoryInterface>(iface: &mut M, geom: &LlcGeometry, cell: &Cell) {
    for region in cell.colored_regions {
        if cell.has_smmu_streams()
            && let Err(err) = apply_region(iface, geom, cell, region, Operation::SmmuDestroy)
        {
            warn!(
                "SMMU unmap of colored region at {:#x} failed: {err}",
                region.memory.virt_start,
            );
        }
        if let Err(err) = apply_region(iface, geom, cell, region, Operation::Destroy) {
            warn!(
                "destroy of colored region at {:#x} failed: {err}",
                region.memory.virt_start,
            );
        }
    }
}

fn flush_regions<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    cell: &Cell,
    kind: DcacheOp,
) {
    if let Err(err) = walk_regions(iface, geom, cell, Operation::Dcache(kind)) {
        warn!("colored D-cache flush failed: {err}");
    }
}

/// Union of the color bitmaps the cell's managed regions draw from the
/// root pool.
fn claimed_colors(cell: &Cell) -> u64 {
    cell.colored_regions
        .iter()
        .filter(|r| r.memory.flags.contains(MemFlags::COLORED_CELL))
        .map(|r| r.colors)
        .fold(0, |acc, colors| acc | colors)
}

/// Completes every map/unmap batch before any other CPU can observe the new
/// tables. Batches touch both guest stage-2 and the hypervisor's own
/// mappings, so both TLB views are dropped.
fn invalidate_tlbs() {
    dsb_ish();
    tlbi_vmalls12e1is();
    tlbi_alle2();
    dsb_ish();
    isb();
}
