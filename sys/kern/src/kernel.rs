// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel singleton and the two scheduling entry points.
//!
//! All mutable kernel state lives in one [`Kernel`] value: the task table,
//! the scheduler queues, the running-task id and the tick counter. On a
//! real target there is exactly one `Kernel`, in a static, reached through
//! [`with_kernel`], which masks interrupts around the access; that is what
//! makes the state safe to touch from task code, from the two
//! context-switch handlers, and from device interrupt handlers calling
//! things like `unsuspend`. Host tests build their own `Kernel` values and
//! call the methods directly.
//!
//! The two entry points mirror the two interrupts that drive scheduling:
//!
//! - [`Kernel::on_tick`] runs from the periodic tick handler: advance
//!   time, wake due sleepers, rotate the running task to the tail of its
//!   level (its time slice is spent), pick again.
//! - [`Kernel::on_reschedule`] runs from the software-pended reschedule
//!   handler: re-queue the running task *only if it is still `Running`* —
//!   a caller that just marked itself sleeping, suspended or waiting must
//!   not be revived — then pick again.

use core::cell::UnsafeCell;

use crate::sched;
use crate::task::{Task, TaskId, TaskState, TaskTable};
use crate::time::Timestamp;

/// Return value for operations that may require a scheduling decision.
/// Marked `must_use` because dropping it silently would lose a needed
/// context switch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub(crate) enum NextTask {
    /// Keep running the current task.
    Same,
    /// Another task should run; pend the reschedule request.
    Other,
}

/// The whole of the kernel's mutable state.
#[derive(Debug)]
pub(crate) struct Kernel {
    pub(crate) tasks: TaskTable,
    pub(crate) sched: sched::Scheduler,
    /// The running task; `None` only before the scheduler starts.
    pub(crate) current: Option<TaskId>,
    pub(crate) tick_count: Timestamp,
    pub(crate) all_head: Option<TaskId>,
    pub(crate) all_tail: Option<TaskId>,
}

impl Kernel {
    pub(crate) const fn new() -> Self {
        Self {
            tasks: TaskTable::new(),
            sched: sched::Scheduler::new(),
            current: None,
            tick_count: Timestamp::ZERO,
            all_head: None,
            all_tail: None,
        }
    }

    /// Id of the running task; halts if asked before the scheduler starts,
    /// since every caller is a task-context entry point.
    pub(crate) fn current_id(&self) -> TaskId {
        match self.current {
            Some(id) => id,
            None => panic!("no current task"),
        }
    }

    /// Picks the first task ever to run. Startup-only counterpart of the
    /// handler entry points.
    pub(crate) fn start_first(&mut self) -> TaskId {
        uassert!(self.current.is_none());
        let id = sched::take_highest_ready(&mut self.tasks, &mut self.sched);
        self.tasks.task_mut(id).state = TaskState::Running;
        self.current = Some(id);
        id
    }

    /// Body of the periodic tick interrupt.
    pub(crate) fn on_tick(&mut self) -> &Task {
        self.tick_count.advance();
        sched::wake_expired(&mut self.tasks, &mut self.sched, self.tick_count);

        // Time-slice rotation: the outgoing task joins the back of the
        // line at its level. Every transition out of Running pends the
        // reschedule interrupt inside the same masked section, and a
        // pended reschedule runs before a pended tick, so the task we
        // interrupted is necessarily still Running.
        let cur = self.current_id();
        uassert_eq!(self.tasks.task(cur).state, TaskState::Running);
        self.tasks.task_mut(cur).state = TaskState::Ready;
        sched::ready_push_tail(&mut self.tasks, &mut self.sched, cur);

        self.switch_to_next()
    }

    /// Body of the software-pended reschedule interrupt.
    pub(crate) fn on_reschedule(&mut self) -> &Task {
        if let Some(cur) = self.current {
            let t = self.tasks.task_mut(cur);
            // Only a plain yield re-queues the caller. A task that went to
            // sleep, suspended itself, started waiting on a resource or
            // stopped has already been parked wherever it belongs (or
            // nowhere).
            if t.state == TaskState::Running {
                t.state = TaskState::Ready;
                sched::ready_push_tail(&mut self.tasks, &mut self.sched, cur);
            }
        }
        self.switch_to_next()
    }

    fn switch_to_next(&mut self) -> &Task {
        let next = sched::take_highest_ready(&mut self.tasks, &mut self.sched);
        self.current = Some(next);
        let t = self.tasks.task_mut(next);
        t.state = TaskState::Running;
        t
    }
}

/// Home of the kernel singleton.
///
/// This is a hand-rolled cell rather than a `RefCell` because the accessor
/// below provides the exclusion: single core, interrupts masked, no
/// reentrant callers.
struct KernelCell(UnsafeCell<Kernel>);

// Safety: all access to the contents goes through `with_kernel`, whose
// masking makes the accesses mutually exclusive on our single core.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

/// Runs `body` with exclusive access to the kernel singleton, interrupts
/// masked for the duration on real targets.
///
/// Keep bodies short: this is the kernel's only critical section, and
/// everything in it happens with the whole interrupt system stalled.
pub(crate) fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    crate::arch::with_interrupts_masked(|| {
        // Safety: single core, interrupts masked, and no code path
        // re-enters with_kernel from inside `body`; the &mut cannot alias.
        let k = unsafe { &mut *KERNEL.0.get() };
        body(k)
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Helpers for building kernels on the host.

    pub(crate) fn nop_entry(_arg: usize) {}

    /// A fresh forever-lived stack; tests leak freely.
    pub(crate) fn leaked_stack(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }
}
