// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;

fn main() {
    println!("cargo:rustc-check-cfg=cfg(armv6m)");
    println!("cargo:rustc-check-cfg=cfg(armv7m)");
    println!("cargo:rustc-check-cfg=cfg(have_fpu)");

    // Expose the M-profile to the arch module. Anything that isn't a
    // Cortex-M target gets the stub architecture and needs no cfgs.
    let target = env::var("TARGET").unwrap();
    if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        println!("cargo:rustc-cfg=armv7m");
    } else if target.starts_with("thumb") {
        println!("Don't know the target {}", target);
        std::process::exit(1);
    }

    // The hard-float ABI implies an FPU whose context must be preserved.
    if target.ends_with("eabihf") {
        println!("cargo:rustc-cfg=have_fpu");
    }
}
