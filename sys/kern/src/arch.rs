// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, tailored for the current target.
//!
//! Each architecture module must define the same set of names: the
//! `SavedState` stored at the head of every TCB, the `klog!`/`uassert!`
//! macros, `with_interrupts_masked`, `pend_context_switch`,
//! `reinitialize`, `start_first_task`, `wait_for_interrupt` and
//! `busy_wait_us`.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        // Not a supported embedded target: use the stub architecture so
        // the portable kernel builds and its tests run on the host.
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
