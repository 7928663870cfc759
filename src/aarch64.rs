// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Barrier, TLB and cache maintenance wrappers.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// D-cache maintenance flavors applied by virtual address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DcacheOp {
    /// Clean to the point of coherency.
    Clean,
    /// Invalidate without writing dirty lines back.
    Invalidate,
    /// Clean, then invalidate.
    CleanAndInvalidate,
}

/// Issues a full system (`sy`) data synchronization barrier (`dsb`) instruction.
pub fn dsb_sy() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Issues a data synchronization barrier (`dsb`) instruction that applies to
/// the inner shareable domain (`ish`).
pub fn dsb_ish() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dsb ish", options(nostack));
    }
}

/// Issues an instruction synchronization barrier (`isb`) instruction.
pub fn isb() {
    // SAFETY: `isb` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Invalidates all stage 1 and stage 2 TLB entries for the current VMID,
/// inner shareable (`vmalls12e1is`).
pub fn tlbi_vmalls12e1is() {
    // SAFETY: `tlbi` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("tlbi vmalls12e1is", options(nostack));
    }
}

/// Invalidates all hypervisor stage 1 TLB entries (`alle2`).
pub fn tlbi_alle2() {
    // SAFETY: `tlbi` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("tlbi alle2", options(nostack));
    }
}

/// Performs `op` on every D-cache line of `[va, va + size)`.
///
/// This is the canonical implementation behind the `dcache_flush_by_va`
/// backend hook. `line_size` must be the line size of the targeted cache
/// level. The address range must be mapped when this runs on hardware.
pub fn dcache_maintain_range(va: u64, size: u64, line_size: u64, op: DcacheOp) {
    let mut line = va & !(line_size - 1);
    while line < va + size {
        match op {
            DcacheOp::Clean => {
                // SAFETY: `dc cvac` only affects cache state, never memory
                // contents.
                #[cfg(target_arch = "aarch64")]
                unsafe {
                    asm!("dc cvac, {line}", options(nostack), line = in(reg) line);
                }
            }
            DcacheOp::Invalidate => {
                // SAFETY: The caller owns the range; dropping its dirty lines
                // is the requested semantic.
                #[cfg(target_arch = "aarch64")]
                unsafe {
                    asm!("dc ivac, {line}", options(nostack), line = in(reg) line);
                }
            }
            DcacheOp::CleanAndInvalidate => {
                // SAFETY: `dc civac` only affects cache state, never memory
                // contents.
                #[cfg(target_arch = "aarch64")]
                unsafe {
                    asm!("dc civac, {line}", options(nostack), line = in(reg) line);
                }
            }
        }
        line += line_size;
    }
    dsb_sy();
}
