// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Last-level-cache coloring for the Rusted Hypervisor.
//!
//! The hypervisor statically assigns CPUs, memory and I/O to isolated cells.
//! This crate additionally partitions the shared last-level cache by
//! constraining which physical page frames each cell may use, so that two
//! cells never map frames indexing to the same LLC sets. A colored region is
//! a contiguous guest-virtual range plus a bitmap of assigned colors; the
//! subsystem expands it into non-contiguous physical fragments and drives the
//! stage-2 tables, SMMU tables and temporary hypervisor mappings through the
//! [`ops::MemoryInterface`] capability trait.

#![cfg_attr(not(any(test, feature = "fakes")), no_std)]

pub mod aarch64;
pub mod cache;
pub mod cell;
pub mod color;
pub mod config;
pub mod fragment;
pub mod lifecycle;
pub mod ops;
pub mod platform;
pub mod recolor;
pub mod sysregs;
pub mod validate;

use thiserror::Error;

/// Errors returned by colored-region operations.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// A colored-region configuration value is unusable.
    #[error("invalid colored-region configuration: {0}")]
    ConfigInvalid(&'static str),
    /// A managed region extends past the root pool, or a manual region
    /// overlaps it.
    #[error("colored region out of bounds of the root pool")]
    OutOfBounds,
    /// The page pool was exhausted while installing page-table nodes.
    #[error("page pool exhausted")]
    OutOfMemory,
    /// An SMMU operation was requested but no SMMU backend is installed.
    #[error("no SMMU backend installed")]
    NotSupported,
    /// A conflicting root-cell mapping was found while returning frames.
    #[error("conflicting root-cell mapping")]
    RootConflict,
}

/// Result type used throughout the subsystem.
pub type Result<T> = core::result::Result<T, Error>;
