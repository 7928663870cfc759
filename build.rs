// Copyright The Rusted Hypervisor Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build script for the coloring subsystem.

/// Platforms with a constants module under `src/platform/`.
const PLATFORMS: [&str; 2] = ["qemu", "fvp"];

fn main() {
    // The platform is selected by the hypervisor build with
    // `--cfg platform="<name>"`; host builds fall back to the test platform.
    println!(
        "cargo::rustc-check-cfg=cfg(platform, values(\"{}\"))",
        PLATFORMS.join("\", \""),
    );
}
