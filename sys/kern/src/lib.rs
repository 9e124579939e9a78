// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kestrel kernel.
//!
//! This is a small fixed-priority, preemptive multitasking kernel for
//! single-core ARM Cortex-M parts: tens of KiB of RAM, no heap, no MMU.
//! Tasks are plain functions with statically allocated stacks; scheduling
//! is strict priority preemption with round-robin inside each priority
//! level, driven by a periodic tick interrupt and a software-pended
//! reschedule interrupt.
//!
//! # Design principles
//!
//! 1. Static everything. Tasks, stacks, resources and queues are allocated
//!    up front; the kernel never allocates.
//! 2. Intrusive queues over an arena. The kernel owns every task control
//!    block forever, in a fixed table; the ready, sleep and waiter queues
//!    thread through the TCBs by index and only ever borrow.
//! 3. Short critical sections. Kernel state is mutated only with
//!    interrupts masked, and only for pointer/index-sized updates; no
//!    variable-length work happens with interrupts off.
//! 4. The portable part stays portable. Everything outside `arch` compiles
//!    and is tested on the host against a stub architecture; only `arch`
//!    touches registers or assembly.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod charbuf;
pub mod err;
#[cfg(target_os = "none")]
pub mod fail;
pub mod kernel;
pub mod sched;
pub mod startup;
pub mod sync;
pub mod task;
pub mod time;
