// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Discovery of the last-level cache geometry.
//!
//! The cache hierarchy identification registers are walked once at
//! hypervisor enable; the last unified level is the coloring target. The
//! resulting [`LlcGeometry`] is immutable for the lifetime of the
//! hypervisor.

use crate::{
    aarch64::isb,
    color::address_color_mask,
    platform::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE},
    sysregs::{CacheType, CsselrEl1, read_ccsidr_el1, read_clidr_el1, write_csselr_el1},
};
use log::{debug, info};

/// Deepest cache level identified by CLIDR_EL1.
pub const MAX_CACHE_LEVELS: usize = 7;

/// Geometry of the cache level selected for coloring, plus the derived
/// color arithmetic constants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LlcGeometry {
    /// Cache level the colors partition, 1-based.
    pub level: usize,
    /// Size of each cache line in bytes.
    pub line_size: u64,
    /// Associativity.
    pub associativity: u64,
    /// Number of sets.
    pub sets: u64,
    /// Total size of the cache in bytes.
    pub size: u64,
    /// Size of a single way in bytes; the stride between frames of the same
    /// color.
    pub way_size: u64,
    /// Number of colors this cache supports. Always a power of two.
    pub color_count: u64,
    /// Physical-address bits selecting the color.
    pub color_mask: u64,
    /// Log2 of the page size.
    pub page_shift: u32,
    /// Size in bytes of a page.
    pub page_size: u64,
    /// Mask clearing the offset bits within a page.
    pub page_mask: u64,
}

impl LlcGeometry {
    /// Builds the geometry of a unified cache at `level` from its CCSIDR
    /// fields.
    pub fn new(level: usize, line_size: u64, associativity: u64, sets: u64) -> Self {
        let way_size = line_size * sets;
        let color_mask = address_color_mask(way_size, PAGE_SIZE);
        let geometry = Self {
            level,
            line_size,
            associativity,
            sets,
            size: line_size * associativity * sets,
            way_size,
            color_count: sets / (PAGE_SIZE / line_size),
            color_mask,
            page_shift: PAGE_SHIFT,
            page_size: PAGE_SIZE,
            page_mask: PAGE_MASK,
        };
        // The mask must sit wholly above the page offset and wholly below
        // the way boundary.
        debug_assert_eq!(geometry.color_count, (color_mask >> PAGE_SHIFT) + 1);
        debug_assert_eq!(color_mask & !PAGE_MASK, 0);
        debug_assert_eq!(color_mask & !(way_size.next_power_of_two() - 1), 0);
        geometry
    }

    /// Log2 of the way size; the position the color walk carries into.
    pub fn way_shift(&self) -> u32 {
        self.page_shift + self.color_count.trailing_zeros()
    }

    /// Highest usable color bitmap value.
    pub fn max_color_value(&self) -> u64 {
        if self.color_count >= u64::BITS as u64 {
            u64::MAX
        } else {
            (1 << self.color_count) - 1
        }
    }

    /// Walks the cache hierarchy and returns the geometry of the last
    /// unified level, or `None` when no colorable unified level exists and
    /// coloring must stay disabled.
    pub fn probe() -> Option<Self> {
        let clidr = read_clidr_el1();
        let mut last_unified = None;

        for level in 1..=MAX_CACHE_LEVELS {
            let ctype = clidr.ctype(level);
            if ctype == CacheType::NoCache {
                continue;
            }

            let geometry = read_level(CsselrEl1::data(level));
            debug!(
                "L{level} cache ({ctype:?}): {} bytes/line, {}-way, {} sets",
                geometry.line_size(),
                geometry.associativity(),
                geometry.sets(),
            );

            if ctype == CacheType::SeparateInstructionAndData {
                let instruction = read_level(CsselrEl1::instruction(level));
                debug!(
                    "L{level} instruction side: {} bytes/line, {}-way, {} sets",
                    instruction.line_size(),
                    instruction.associativity(),
                    instruction.sets(),
                );
            }

            if ctype == CacheType::Unified {
                last_unified = Some((level, geometry));
            }
        }

        let Some((level, ccsidr)) = last_unified else {
            info!("no unified cache level found");
            return None;
        };
        if ccsidr.line_size() * ccsidr.sets() <= PAGE_SIZE {
            // The set-index bits all fall inside the page offset, so frames
            // cannot be told apart by color.
            info!("L{level} way size does not exceed the page size");
            return None;
        }

        let geometry = Self::new(
            level,
            ccsidr.line_size(),
            ccsidr.associativity(),
            ccsidr.sets(),
        );
        info!(
            "L{} cache selected for coloring: way size {:#x}, {} colors, mask {:#x}",
            geometry.level, geometry.way_size, geometry.color_count, geometry.color_mask,
        );
        Some(geometry)
    }
}

fn read_level(selection: CsselrEl1) -> crate::sysregs::CcsidrEl1 {
    write_csselr_el1(selection);
    isb();
    read_ccsidr_el1()
}
