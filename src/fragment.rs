// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Expansion of a colored region into physical fragments.
//!
//! A fragment is one contiguous physical-virtual slice, the unit of
//! map/unmap. Fragments are emitted in ascending virtual order: the guest
//! sees a contiguous virtual range backed by a color-restricted physical
//! striping, one fragment per run of contiguous colors per way-sized stride.

use crate::{
    cache::LlcGeometry,
    color::{ColorRanges, clamp_colors},
    config::{ColoredRegion, MemFlags},
    platform::{PAGE_SIZE, ROOT_MAP_OFFSET},
};

/// A contiguous physical-virtual slice of a colored region.
///
/// Fragments live for one operation and are never stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fragment {
    /// Host-physical base address.
    pub phys_start: u64,
    /// Guest-virtual base address.
    pub virt_start: u64,
    /// Size in bytes.
    pub size: u64,
    /// Flags inherited from the region.
    pub flags: MemFlags,
}

impl Fragment {
    /// Whether the fragment must be routed to the MMIO subpage registrar
    /// instead of the page tables.
    pub fn is_subpage(&self) -> bool {
        self.virt_start % PAGE_SIZE != 0 || self.size % PAGE_SIZE != 0
    }

    /// The same fragment at the loader offset, far away from ordinary cell
    /// memory.
    pub fn loader_view(&self) -> Fragment {
        Fragment {
            virt_start: self.virt_start + ROOT_MAP_OFFSET,
            ..*self
        }
    }

    /// The fragment as the root cell sees it: the root's RAM is identity
    /// mapped, so its virtual address is the physical one.
    pub fn root_view(&self) -> Fragment {
        Fragment {
            virt_start: self.phys_start,
            ..*self
        }
    }
}

/// Iterator producing the fragments of a colored region in virtual-address
/// order.
#[derive(Clone, Debug)]
pub struct Fragments {
    phys_base: u64,
    flags: MemFlags,
    colors: u64,
    ranges: ColorRanges,
    stride: u64,
    cursor: u64,
    end: u64,
    fragment_size: u64,
    fragment_offset: u64,
}

impl Fragments {
    /// Creates the fragment sequence for `region` under `geom`.
    pub fn new(region: &ColoredRegion, geom: &LlcGeometry) -> Self {
        let colors = clamp_colors(geom, region.colors);
        Self {
            phys_base: region.memory.phys_start + region.rebase_offset,
            flags: region.memory.flags,
            colors,
            ranges: ColorRanges::new(colors),
            stride: 0,
            cursor: region.memory.virt_start,
            end: region.memory.virt_start + region.memory.size,
            fragment_size: geom.page_size,
            fragment_offset: geom.way_size,
        }
    }
}

impl Iterator for Fragments {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        if self.cursor >= self.end || self.colors == 0 {
            return None;
        }

        let range = loop {
            match self.ranges.next() {
                Some(range) => break range,
                None => {
                    self.stride += 1;
                    self.ranges = ColorRanges::new(self.colors);
                }
            }
        };

        let size = (range.count() * self.fragment_size).min(self.end - self.cursor);
        let fragment = Fragment {
            phys_start: self.phys_base
                + u64::from(range.first) * self.fragment_size
                + self.stride * self.fragment_offset,
            virt_start: self.cursor,
            size,
            flags: self.flags,
        };
        self.cursor += size;
        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryRegion;

    fn geometry() -> LlcGeometry {
        LlcGeometry::new(2, 64, 16, 1024)
    }

    fn region(phys: u64, virt: u64, size: u64, colors: u64) -> ColoredRegion {
        ColoredRegion {
            memory: MemoryRegion {
                phys_start: phys,
                virt_start: virt,
                size,
                flags: MemFlags::READ | MemFlags::WRITE,
            },
            colors,
            rebase_offset: 0,
        }
    }

    #[test]
    fn single_color_run_strides_by_way_size() {
        let geom = geometry();
        let frags: Vec<_> =
            Fragments::new(&region(0, 0x8000_0000, 0x40000, 0x0f00), &geom).collect();

        assert_eq!(frags.len(), 16);
        let leading: Vec<u64> = frags.iter().take(4).map(|f| f.phys_start).collect();
        assert_eq!(leading, [0x8000, 0x18000, 0x28000, 0x38000]);
        for (index, frag) in frags.iter().enumerate() {
            assert_eq!(frag.size, 0x4000);
            assert_eq!(frag.virt_start, 0x8000_0000 + index as u64 * 0x4000);
            assert_eq!(frag.phys_start, 0x8000 + index as u64 * 0x10000);
        }
    }

    #[test]
    fn scattered_colors_emit_one_fragment_per_run() {
        let geom = geometry();
        // Colors 0, 2 and 3: runs [0,0] and [2,3].
        let frags: Vec<_> = Fragments::new(&region(0, 0x4000_0000, 0x6000, 0xd), &geom).collect();

        assert_eq!(
            frags,
            [
                Fragment {
                    phys_start: 0x0000,
                    virt_start: 0x4000_0000,
                    size: 0x1000,
                    flags: MemFlags::READ | MemFlags::WRITE,
                },
                Fragment {
                    phys_start: 0x2000,
                    virt_start: 0x4000_1000,
                    size: 0x2000,
                    flags: MemFlags::READ | MemFlags::WRITE,
                },
                Fragment {
                    phys_start: 0x10000,
                    virt_start: 0x4000_3000,
                    size: 0x1000,
                    flags: MemFlags::READ | MemFlags::WRITE,
                },
                Fragment {
                    phys_start: 0x12000,
                    virt_start: 0x4000_4000,
                    size: 0x2000,
                    flags: MemFlags::READ | MemFlags::WRITE,
                },
            ]
        );
    }

    #[test]
    fn coverage_is_gapless_and_ordered() {
        let geom = geometry();
        let total = 0x81000;
        let frags: Vec<_> =
            Fragments::new(&region(0x40000, 0x8000_0000, total, 0x8421), &geom).collect();

        let mut cursor = 0x8000_0000;
        let mut sum = 0;
        for frag in &frags {
            assert_eq!(frag.virt_start, cursor);
            cursor += frag.size;
            sum += frag.size;
        }
        assert_eq!(sum, total);
    }

    #[test]
    fn color_purity() {
        let geom = geometry();
        let colors = 0x00f0;
        let frags: Vec<_> =
            Fragments::new(&region(0, 0x8000_0000, 0x20000, colors), &geom).collect();
        for frag in &frags {
            let mut page = frag.phys_start;
            while page < frag.phys_start + frag.size {
                assert_ne!((1 << crate::color::color_of(&geom, page)) & colors, 0);
                page += geom.page_size;
            }
        }
    }

    #[test]
    fn stride_span_matches_color_share() {
        let geom = geometry();
        let size = 0x40000;
        let colors: u64 = 0x000f;
        let frags: Vec<_> = Fragments::new(&region(0, 0x8000_0000, size, colors), &geom).collect();
        let strides = size / (colors.count_ones() as u64 * geom.page_size);
        let last = frags.last().unwrap();
        assert_eq!(last.phys_start, (strides - 1) * geom.way_size);
    }

    #[test]
    fn rebase_offset_shifts_physical_addresses() {
        let geom = geometry();
        let mut rebased = region(0, 0x8000_0000, 0x8000, 0x000f);
        rebased.rebase_offset = 0x9_0000_0000;
        let frags: Vec<_> = Fragments::new(&rebased, &geom).collect();
        assert_eq!(frags[0].phys_start, 0x9_0000_0000);
        assert_eq!(frags[1].phys_start, 0x9_0001_0000);
    }

    #[test]
    fn empty_color_bitmap_yields_nothing() {
        let geom = geometry();
        assert_eq!(Fragments::new(&region(0, 0, 0x4000, 0), &geom).count(), 0);
    }

    #[test]
    fn disjoint_bitmaps_share_no_frames() {
        let geom = geometry();
        let a: Vec<_> = Fragments::new(&region(0, 0x8000_0000, 0x40000, 0x00ff), &geom).collect();
        let b: Vec<_> = Fragments::new(&region(0, 0x8000_0000, 0x40000, 0xff00), &geom).collect();

        let pages = |frags: &[Fragment]| {
            let mut set = std::collections::BTreeSet::new();
            for frag in frags {
                let mut page = frag.phys_start;
                while page < frag.phys_start + frag.size {
                    set.insert(page);
                    page += geom.page_size;
                }
            }
            set
        };
        assert!(pages(&a).is_disjoint(&pages(&b)));
    }

    #[test]
    fn subpage_and_loader_views() {
        let frag = Fragment {
            phys_start: 0x2000,
            virt_start: 0x8000_0000,
            size: 0x1000,
            flags: MemFlags::LOADABLE,
        };
        assert!(!frag.is_subpage());
        assert_eq!(frag.loader_view().virt_start, 0x8000_0000 + ROOT_MAP_OFFSET);
        assert_eq!(frag.loader_view().phys_start, 0x2000);

        let subpage = Fragment {
            phys_start: 0x2000,
            virt_start: 0x8000_0100,
            size: 0x100,
            flags: MemFlags::IO,
        };
        assert!(subpage.is_subpage());
    }
}
