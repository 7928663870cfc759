// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! In-place recoloring of the root cell's RAM.
//!
//! When the hypervisor takes over, the root OS already populated its RAM in
//! the natural identity layout. The engine rewrites the physical layout to
//! the color striping without losing the contents: it installs a contiguous
//! hypervisor view of the colored frames, then streams page copies from the
//! identity range through a temporary window. The colored range may overlap
//! the identity range, and every colored frame sits at or above its identity
//! counterpart, so the copy must run backwards, both across slices and
//! across the pages of a slice. At shutdown the reverse copy runs forwards
//! for the same reason.

use crate::{
    Result,
    cache::LlcGeometry,
    cell::Cell,
    config::ColoredRegion,
    ops::{HV_PAGE_FLAGS, MemoryInterface, Operation, PagingOpts, apply_region},
    platform::{
        NUM_TEMPORARY_PAGES, PAGE_SHIFT, PAGE_SIZE, ROOT_MAP_OFFSET, temporary_mapping_base,
    },
};
use log::{debug, info};

/// Copies a root colored region from its identity layout into the color
/// striping.
pub fn color_root_region<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    root: &Cell,
    region: &ColoredRegion,
) -> Result<()> {
    apply_region(iface, geom, root, region, Operation::HvCreate)?;
    info!(
        "recoloring root RAM at {:#x} (size {:#x}, colors {:#x})",
        region.memory.phys_start, region.memory.size, region.colors,
    );
    copy_to_colored(iface, region)?;
    apply_region(iface, geom, root, region, Operation::HvDestroy)
}

/// Copies a root colored region from the color striping back into the
/// identity layout.
pub fn uncolor_root_region<M: MemoryInterface>(
    iface: &mut M,
    geom: &LlcGeometry,
    root: &Cell,
    region: &ColoredRegion,
) -> Result<()> {
    apply_region(iface, geom, root, region, Operation::HvCreate)?;
    info!(
        "rewinding root RAM at {:#x} to the identity layout",
        region.memory.phys_start,
    );
    copy_from_colored(iface, region)?;
    apply_region(iface, geom, root, region, Operation::HvDestroy)
}

/// Streams the identity contents into the colored frames, backwards.
///
/// The temporary window aliases a sliding slice of the identity range; the
/// colored destination is reached through the contiguous view installed at
/// [`ROOT_MAP_OFFSET`]. Each slice is remapped over the preallocated window,
/// so pool consumption stays bounded.
fn copy_to_colored<M: MemoryInterface>(iface: &mut M, region: &ColoredRegion) -> Result<()> {
    let window = temporary_mapping_base();
    let window_size = NUM_TEMPORARY_PAGES * PAGE_SIZE;
    let mut remaining = region.memory.size;
    let mut phys = region.memory.phys_start + remaining;
    let mut virt = region.memory.virt_start + remaining;

    while remaining > 0 {
        let size = remaining.min(window_size);
        phys -= size;
        virt -= size;
        iface.paging_create(
            phys,
            size,
            window,
            HV_PAGE_FLAGS,
            PagingOpts::NON_COHERENT | PagingOpts::NO_HUGE,
        )?;
        debug!("coloring slice {phys:#x}..{:#x}", phys + size);
        // Highest page first: a colored frame never sits below its identity
        // counterpart, so earlier copies cannot clobber unread source pages.
        for page in (0..size >> PAGE_SHIFT).rev() {
            iface.copy_page(
                ROOT_MAP_OFFSET + virt + (page << PAGE_SHIFT),
                window + (page << PAGE_SHIFT),
            );
        }
        remaining -= size;
    }
    iface.paging_destroy(
        window,
        window_size.min(region.memory.size),
        PagingOpts::NON_COHERENT | PagingOpts::NO_HUGE,
    )
}

/// Streams the colored contents back into the identity frames, forwards.
fn copy_from_colored<M: MemoryInterface>(iface: &mut M, region: &ColoredRegion) -> Result<()> {
    let window = temporary_mapping_base();
    let window_size = NUM_TEMPORARY_PAGES * PAGE_SIZE;
    let mut remaining = region.memory.size;
    let mut phys = region.memory.phys_start;
    let mut virt = region.memory.virt_start;

    while remaining > 0 {
        let size = remaining.min(window_size);
        iface.paging_create(
            phys,
            size,
            window,
            HV_PAGE_FLAGS,
            PagingOpts::NON_COHERENT | PagingOpts::NO_HUGE,
        )?;
        debug!("rewinding slice {phys:#x}..{:#x}", phys + size);
        // Lowest page first: the identity frame never sits above its colored
        // counterpart.
        for page in 0..size >> PAGE_SHIFT {
            iface.copy_page(
                window + (page << PAGE_SHIFT),
                ROOT_MAP_OFFSET + virt + (page << PAGE_SHIFT),
            );
        }
        phys += size;
        virt += size;
        remaining -= size;
    }
    iface.paging_destroy(
        window,
        window_size.min(region.memory.size),
        PagingOpts::NON_COHERENT | PagingOpts::NO_HUGE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellId, TableRoot};
    use crate::config::{MemFlags, MemoryRegion};
    use crate::fragment::Fragments;
    use crate::ops::fake::FakeMemory;

    fn geometry() -> LlcGeometry {
        LlcGeometry::new(2, 64, 16, 1024)
    }

    fn root_region(phys: u64, size: u64, colors: u64) -> ColoredRegion {
        ColoredRegion {
            memory: MemoryRegion {
                phys_start: phys,
                virt_start: phys,
                size,
                flags: MemFlags::READ | MemFlags::WRITE,
            },
            colors,
            rebase_offset: 0,
        }
    }

    fn root_cell<'d>(regions: &'d [ColoredRegion]) -> Cell<'d> {
        Cell {
            id: CellId::ROOT,
            mem_regions: &[],
            colored_regions: regions,
            stage2_root: TableRoot(0x4000),
            smmu_root: TableRoot(0x8000),
            num_stream_ids: 0,
        }
    }

    /// Writes a distinct byte pattern into each identity page.
    fn fill_pattern(fake: &mut FakeMemory, region: &ColoredRegion) {
        for page in 0..region.memory.size / PAGE_SIZE {
            let value = (page as u8).wrapping_mul(31).wrapping_add(7);
            fake.write_phys(
                region.memory.phys_start + page * PAGE_SIZE,
                &[value; 8],
            );
        }
    }

    /// Returns the colored frame backing each page of the region, in
    /// virtual order.
    fn colored_frames(geom: &LlcGeometry, region: &ColoredRegion) -> Vec<u64> {
        let mut frames = Vec::new();
        for frag in Fragments::new(region, geom) {
            for page in 0..frag.size / PAGE_SIZE {
                frames.push(frag.phys_start + page * PAGE_SIZE);
            }
        }
        frames
    }

    #[test]
    fn forward_copy_preserves_contents() {
        let geom = geometry();
        // Colors 0..1 of 16: the striping spreads 32 pages over 16 ways,
        // overlapping the identity range.
        let region = root_region(0x10_0000, 0x20000, 0x0003);
        let cell = root_cell(core::slice::from_ref(&region));
        let mut fake = FakeMemory::new();
        fill_pattern(&mut fake, &region);

        color_root_region(&mut fake, &geom, &cell, &region).unwrap();

        for (page, frame) in colored_frames(&geom, &region).into_iter().enumerate() {
            let expected = (page as u8).wrapping_mul(31).wrapping_add(7);
            assert_eq!(fake.read_phys(frame), expected, "page {page}");
        }
        // The scratch and linear mappings are gone.
        assert!(fake.tables.hv_maps.is_empty());
    }

    #[test]
    fn round_trip_restores_the_identity_layout() {
        let geom = geometry();
        let region = root_region(0x40_0000, 0x40000, 0x00ff);
        let cell = root_cell(core::slice::from_ref(&region));
        let mut fake = FakeMemory::new();
        fill_pattern(&mut fake, &region);

        color_root_region(&mut fake, &geom, &cell, &region).unwrap();
        uncolor_root_region(&mut fake, &geom, &cell, &region).unwrap();

        for page in 0..region.memory.size / PAGE_SIZE {
            let expected = (page as u8).wrapping_mul(31).wrapping_add(7);
            assert_eq!(
                fake.read_phys(region.memory.phys_start + page * PAGE_SIZE),
                expected,
                "page {page}",
            );
        }
        assert!(fake.tables.hv_maps.is_empty());
    }

    #[test]
    fn overlap_is_survived_by_the_reverse_order() {
        let geom = geometry();
        // Half the colors: every second identity page moves one way up, so
        // source and destination ranges interleave heavily.
        let region = root_region(0x10_0000, 0x80000, 0x00ff);
        let cell = root_cell(core::slice::from_ref(&region));
        let mut fake = FakeMemory::new();
        fill_pattern(&mut fake, &region);

        color_root_region(&mut fake, &geom, &cell, &region).unwrap();

        for (page, frame) in colored_frames(&geom, &region).into_iter().enumerate() {
            let expected = (page as u8).wrapping_mul(31).wrapping_add(7);
            assert_eq!(fake.read_phys(frame), expected, "page {page}");
        }
    }

    #[test]
    fn identity_striping_is_a_fixed_point() {
        let geom = geometry();
        // All 16 colors selected: the striping equals the identity layout.
        let region = root_region(0x10_0000, 0x10000, 0xffff);
        let cell = root_cell(core::slice::from_ref(&region));
        let mut fake = FakeMemory::new();
        fill_pattern(&mut fake, &region);

        color_root_region(&mut fake, &geom, &cell, &region).unwrap();

        for page in 0..region.memory.size / PAGE_SIZE {
            let expected = (page as u8).wrapping_mul(31).wrapping_add(7);
            assert_eq!(
                fake.read_phys(region.memory.phys_start + page * PAGE_SIZE),
                expected,
            );
        }
    }
}
