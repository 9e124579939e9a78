// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stub architecture for running the portable kernel on a host.
//!
//! There is no interrupt controller and no task stack discipline here;
//! host tests construct `Kernel` values directly and call the scheduling
//! entry points themselves. Everything below is the minimum surface the
//! portable code links against.

macro_rules! klog {
    ($s:expr) => { std::println!($s) };
    ($s:expr, $($tt:tt)*) => { std::println!($s, $($tt)*) };
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        assert_eq!($left, $right)
    };
}

/// No machine registers to save on the host; tests only exercise the
/// portable state machine.
#[derive(Debug, Default)]
pub struct SavedState {}

/// No interrupts to mask; exclusion is the test harness's problem.
pub fn with_interrupts_masked<R>(body: impl FnOnce() -> R) -> R {
    body()
}

/// Reschedule requests are meaningless without an interrupt controller;
/// tests invoke `Kernel::on_reschedule` directly where a real target
/// would take the pended interrupt.
pub fn pend_context_switch() {}

/// Nothing to seed: there is no frame to build on a host stack.
pub fn reinitialize(_task: &mut crate::task::Task) {}

pub fn wait_for_interrupt() {
    std::hint::spin_loop();
}

pub fn busy_wait_us(_us: u32) {}

pub fn set_clock_freq(_cpu_hz: u32) {}

/// # Safety
///
/// Mirrors the real architecture's signature; there is nothing to go
/// wrong here because it never dispatches anything.
pub unsafe fn start_first_task(
    _tick_divisor: u32,
    _task: &mut crate::task::Task,
) -> ! {
    panic!("cannot enter task context on the host");
}
