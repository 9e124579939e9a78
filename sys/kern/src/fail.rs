// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording kernel failures where tooling can find them.
//!
//! Fatal conditions in this kernel do not unwind or reboot; they park the
//! CPU and leave a description behind for a debugger. The binary
//! interface is two symbols:
//!
//! - `KERNEL_HAS_FAILED`, a `bool`: cleared at boot, set on the way into
//!   [`die`] (including via `panic!`). Any other value means the kernel
//!   never booted or scribbled on itself going down.
//! - `KERNEL_EPITAPH`, a byte array: as much of the failure description
//!   as fits, UTF-8, NUL-padded. Trim trailing NULs before printing.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

/// One-stop flag for kernel triage from a debugger.
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

/// Truncated description of what killed the kernel, NUL-padded.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn claim_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Plain statics rather than atomics because ARMv6-M lacks the swap we
    // would want, and this path runs with the rest of the system already
    // presumed broken.
    //
    // Safety: this is the only site that touches the flag, and the check
    // below lets only one execution proceed to the buffer.
    let earlier_failure = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if earlier_failure {
        // A second failure while reporting the first, i.e. a recursive
        // panic. Anything we do here can only make the record worse, so
        // stop moving.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: the flag admits exactly one claimant.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` as the kernel's last words and parks the CPU. A debugger
/// finds the text in `KERNEL_EPITAPH`.
#[inline(never)]
pub fn die(msg: impl Display) -> ! {
    let mut w = EpitaphWriter {
        remaining: claim_epitaph(),
    };
    write!(w, "{}", msg).ok();

    loop {
        // Platform-independent NOP.
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct EpitaphWriter {
    remaining: &'static mut [u8],
}

impl Write for EpitaphWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.remaining.len());
        let taken = core::mem::take(&mut self.remaining);
        let (dst, rest) = taken.split_at_mut(n);
        dst.copy_from_slice(&s[..n]);
        self.remaining = rest;
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
