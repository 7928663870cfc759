// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Pre-creation checks for colored regions.
//!
//! Runs in the driver context before the cell-create hypercall is issued.
//! Managed regions get their physical base filled in from the root pool;
//! manual regions are checked for overlap with it. The walk never installs
//! mappings: bounds are computed by simulating the color allocation.

use crate::{
    Error, Result,
    cache::LlcGeometry,
    cell::CellId,
    color::next_colored,
    config::{ColoredRegion, MemFlags, MemoryRegion, is_page_multiple},
};
use log::{debug, warn};

/// Returns the root cell's colored pool: the single region flagged
/// [`MemFlags::COLORED`], from which managed colored allocations are drawn.
pub fn root_pool(mem_regions: &[MemoryRegion]) -> Option<&MemoryRegion> {
    mem_regions.iter().find(|r| r.flags.contains(MemFlags::COLORED))
}

/// Walks the color allocation of `size` bytes starting at `start` without
/// installing anything, and returns the first address past the last
/// allocated page.
pub fn simulate_coloring(geom: &LlcGeometry, start: u64, size: u64, col_val: u64) -> u64 {
    let mut end = start & geom.page_mask;
    let mut remaining = size;
    while remaining > 0 {
        end = next_colored(geom, end, col_val) + geom.page_size;
        remaining -= remaining.min(geom.page_size);
    }
    end
}

/// Validates and completes the colored regions of a cell about to be
/// created.
///
/// For managed regions the root pool base is written into `phys_start` and
/// the simulated allocation must stay inside the pool; manual regions must
/// not touch the pool at either endpoint. `claimed_colors` is the union of
/// the color bitmaps managed cells already hold against the pool; a managed
/// region intersecting it is refused. Root-cell regions flagged
/// [`MemFlags::COLORED_CELL`] have the flag stripped silently and are
/// otherwise left alone.
pub fn cell_setup(
    geom: Option<&LlcGeometry>,
    cell_id: CellId,
    colored_regions: &mut [ColoredRegion],
    root_pool: Option<&MemoryRegion>,
    claimed_colors: u64,
) -> Result<()> {
    for region in colored_regions {
        if cell_id.is_root() && region.memory.flags.contains(MemFlags::COLORED_CELL) {
            // Managed mode is not available to the root cell; the region
            // falls back to ordinary handling.
            debug!(
                "stripping managed coloring from root region at {:#x}",
                region.memory.virt_start,
            );
            region.memory.flags -= MemFlags::COLORED_CELL;
            continue;
        }
        if cell_id.is_root() {
            continue;
        }

        let Some(geom) = geom else {
            return Err(Error::ConfigInvalid(
                "colored region declared but no unified cache level found",
            ));
        };

        if !is_page_multiple(region.memory.size) {
            return Err(Error::ConfigInvalid(
                "colored region size is not a page multiple",
            ));
        }
        if region.colors == 0 {
            return Err(Error::ConfigInvalid("color bitmap is zero"));
        }
        if region.colors > geom.max_color_value() {
            return Err(Error::ConfigInvalid(
                "color bitmap exceeds the number of available colors",
            ));
        }

        if !region.is_managed() {
            warn!(
                "cell {} uses a custom colored pool at {:#x}",
                cell_id.0, region.memory.phys_start,
            );
            check_pool_overlap(geom, region, root_pool)?;
            continue;
        }

        let Some(pool) = root_pool else {
            return Err(Error::ConfigInvalid(
                "managed colored region without a root colored pool",
            ));
        };
        if region.colors & claimed_colors != 0 {
            return Err(Error::ConfigInvalid(
                "colors already claimed by another managed cell",
            ));
        }

        region.memory.phys_start = pool.phys_start;
        let end = simulate_coloring(geom, pool.phys_start, region.memory.size, region.colors);
        if end > pool.phys_end() {
            warn!(
                "managed colored region needs up to {end:#x}, past the pool end {:#x}",
                pool.phys_end(),
            );
            return Err(Error::OutOfBounds);
        }
    }
    Ok(())
}

/// Refuses a manual region whose simulated extent touches the root pool.
fn check_pool_overlap(
    geom: &LlcGeometry,
    region: &ColoredRegion,
    root_pool: Option<&MemoryRegion>,
) -> Result<()> {
    let Some(pool) = root_pool else {
        return Ok(());
    };
    if pool.contains_phys(region.memory.phys_start) {
        return Err(Error::OutOfBounds);
    }
    let end = simulate_coloring(
        geom,
        region.memory.phys_start,
        region.memory.size,
        region.colors,
    );
    if pool.contains_phys(end) {
        return Err(Error::OutOfBounds);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL_BASE: u64 = 0x8_0000_0000;
    const POOL_SIZE: u64 = 0x8000_0000;

    fn geometry() -> LlcGeometry {
        LlcGeometry::new(2, 64, 16, 1024)
    }

    fn pool() -> MemoryRegion {
        MemoryRegion {
            phys_start: POOL_BASE,
            virt_start: POOL_BASE,
            size: POOL_SIZE,
            flags: MemFlags::READ | MemFlags::WRITE | MemFlags::COLORED,
        }
    }

    fn managed(size: u64, colors: u64) -> ColoredRegion {
        ColoredRegion {
            memory: MemoryRegion {
                phys_start: 0,
                virt_start: 0x8000_0000,
                size,
                flags: MemFlags::READ | MemFlags::WRITE | MemFlags::COLORED_CELL,
            },
            colors,
            rebase_offset: 0,
        }
    }

    fn manual(phys: u64, size: u64, colors: u64) -> ColoredRegion {
        ColoredRegion {
            memory: MemoryRegion {
                phys_start: phys,
                virt_start: 0x8000_0000,
                size,
                flags: MemFlags::READ | MemFlags::WRITE,
            },
            colors,
            rebase_offset: 0,
        }
    }

    #[test]
    fn root_pool_is_found_by_flag() {
        let regions = [
            MemoryRegion {
                phys_start: 0x4000_0000,
                virt_start: 0x4000_0000,
                size: 0x1000_0000,
                flags: MemFlags::READ | MemFlags::WRITE,
            },
            pool(),
        ];
        assert_eq!(root_pool(&regions), Some(&regions[1]));
        assert_eq!(root_pool(&regions[..1]), None);
    }

    #[test]
    fn simulation_counts_strides() {
        let geom = geometry();
        // 4 of 16 colors: each way-sized stride carries 4 pages.
        let end = simulate_coloring(&geom, POOL_BASE, 0x10000, 0xf000);
        // 16 pages over 4 strides; the last page is color 15 of stride 3.
        assert_eq!(end, POOL_BASE + 3 * 0x10000 + 0xf000 + 0x1000);
    }

    #[test]
    fn managed_region_gets_the_pool_base() {
        let geom = geometry();
        let mut regions = [managed(0x1000_0000, 0xf000)];
        cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0).unwrap();
        assert_eq!(regions[0].memory.phys_start, POOL_BASE);
    }

    #[test]
    fn managed_region_overflowing_the_pool_is_refused() {
        let geom = geometry();
        let mut regions = [managed(0x9000_0000, 0xf000)];
        assert_eq!(
            cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0),
            Err(Error::OutOfBounds),
        );
    }

    #[test]
    fn unaligned_size_is_refused() {
        let geom = geometry();
        let mut regions = [managed(0x10800, 0x000f)];
        assert!(matches!(
            cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0),
            Err(Error::ConfigInvalid(_)),
        ));
    }

    #[test]
    fn zero_colors_are_refused() {
        let geom = geometry();
        let mut regions = [managed(0x10000, 0)];
        assert!(matches!(
            cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0),
            Err(Error::ConfigInvalid(_)),
        ));
    }

    #[test]
    fn out_of_range_colors_are_refused() {
        let geom = geometry();
        let mut regions = [managed(0x10000, 0x1_0000)];
        assert!(matches!(
            cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0),
            Err(Error::ConfigInvalid(_)),
        ));
    }

    #[test]
    fn missing_geometry_is_fatal_for_colored_cells() {
        let mut regions = [managed(0x10000, 0x000f)];
        assert!(matches!(
            cell_setup(None, CellId(1), &mut regions, Some(&pool()), 0),
            Err(Error::ConfigInvalid(_)),
        ));
    }

    #[test]
    fn managed_region_without_pool_is_refused() {
        let geom = geometry();
        let mut regions = [managed(0x10000, 0x000f)];
        assert!(matches!(
            cell_setup(Some(&geom), CellId(1), &mut regions, None, 0),
            Err(Error::ConfigInvalid(_)),
        ));
    }

    #[test]
    fn claimed_colors_are_refused() {
        let geom = geometry();
        let mut regions = [managed(0x10000, 0x00f0)];
        assert!(matches!(
            cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0x0030),
            Err(Error::ConfigInvalid(_)),
        ));
        // Disjoint claims pass.
        cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0xff00).unwrap();
    }

    #[test]
    fn manual_region_outside_the_pool_is_accepted() {
        let geom = geometry();
        let mut regions = [manual(0x4000_0000, 0x100000, 0x00ff)];
        cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0).unwrap();
        // The physical base is taken verbatim.
        assert_eq!(regions[0].memory.phys_start, 0x4000_0000);
    }

    #[test]
    fn manual_region_starting_inside_the_pool_is_refused() {
        let geom = geometry();
        let mut regions = [manual(POOL_BASE + 0x10_0000, 0x10000, 0x00ff)];
        assert_eq!(
            cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0),
            Err(Error::OutOfBounds),
        );
    }

    #[test]
    fn manual_region_growing_into_the_pool_is_refused() {
        let geom = geometry();
        // Starts below the pool but the simulated extent reaches into it.
        let mut regions = [manual(POOL_BASE - 0x20000, 0x40000, 0x0001)];
        assert_eq!(
            cell_setup(Some(&geom), CellId(1), &mut regions, Some(&pool()), 0),
            Err(Error::OutOfBounds),
        );
    }

    #[test]
    fn root_managed_flag_is_stripped_silently() {
        let geom = geometry();
        let mut regions = [managed(0x10000, 0x000f)];
        cell_setup(Some(&geom), CellId::ROOT, &mut regions, Some(&pool()), 0).unwrap();
        assert!(!regions[0].memory.flags.contains(MemFlags::COLORED_CELL));
        // The base is left untouched.
        assert_eq!(regions[0].memory.phys_start, 0);
    }
}
