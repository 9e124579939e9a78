// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! An application's reset path does its hardware bring-up, calls
//! [`init`], registers its tasks, and finally calls [`start`], which
//! configures the tick, dispatches the most important ready task, and
//! never returns. The idle task installed by `init` guarantees the
//! scheduler always has something to pick.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::kernel::with_kernel;
use crate::task::{Task, TaskId, IDLE_PRIORITY};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Stack for the idle task. It calls nothing but the wait-for-interrupt
/// primitive, so the minimum stack is plenty.
static mut IDLE_STACK: [u8; 128] = [0; 128];

/// The idle task: park the core until the next interrupt, forever.
fn idle_main(_arg: usize) {
    loop {
        crate::arch::wait_for_interrupt();
    }
}

/// One-time kernel initialization. Installs the idle task at the least
/// important priority. Must run before any task is created.
///
/// # Panics
///
/// If called twice.
pub fn init() {
    let was = INITIALIZED.swap(true, Ordering::Relaxed);
    uassert!(!was);

    klog!("kestrel: init");

    // Safety: the flag above makes this the only borrow ever taken.
    let stack =
        unsafe { &mut *core::ptr::addr_of_mut!(IDLE_STACK) } as &mut [u8];

    with_kernel(|k| {
        let id = match k.init_task("idle", stack, IDLE_PRIORITY, idle_main, 0)
        {
            Ok(id) => id,
            Err(_) => panic!("idle task init failed"),
        };
        if k.add_task(id).is_err() {
            panic!("idle task add failed");
        }
    });
}

/// Id of the first task the scheduler will run, chosen and marked Running
/// under the kernel lock; returned as a raw pointer so the architecture
/// layer can dispatch it after the lock is gone.
fn pick_first_task() -> *mut Task {
    with_kernel(|k| {
        let id: TaskId = k.start_first();
        k.tasks.task_mut(id) as *mut Task
    })
}

/// Starts multitasking: programs the periodic tick at `tick_hz` (given
/// the core clock `cpu_hz`), drops the two context-switch interrupts to
/// the lowest priority, and transfers control to the most important ready
/// task. **Does not return.**
///
/// # Panics
///
/// If `init` has not run, or the tick request is out of the hardware's
/// range.
pub fn start(tick_hz: u32, cpu_hz: u32) -> ! {
    uassert!(INITIALIZED.load(Ordering::Relaxed));
    uassert!(tick_hz > 0);
    let tick_divisor = cpu_hz / tick_hz;
    uassert!(tick_divisor > 0);

    klog!("kestrel: starting tasks");
    crate::arch::set_clock_freq(cpu_hz);

    let first = pick_first_task();
    // Safety: the pointer refers into the static kernel arena, which
    // outlives everything; nothing else touches the task between the pick
    // above and the dispatch below because interrupts are still quiet.
    unsafe { crate::arch::start_first_task(tick_divisor, &mut *first) }
}
