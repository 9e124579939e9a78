// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks: the control block, the task table, and the task-manipulation
//! entry points.
//!
//! The kernel owns every task control block for the life of the system, in
//! a fixed-capacity table. Task ids are handed out monotonically and
//! double as the table index; a slot is never reused. Every queue in the
//! kernel (ready, sleep, resource waiters, the all-tasks enumeration list)
//! is threaded through the TCBs by id, so queue membership costs no
//! memory and unlinking is O(1).

use core::ptr;

use crate::err::TaskError;
use crate::kernel::{with_kernel, Kernel, NextTask};
use crate::time::Timestamp;

/// Number of distinct priority levels. Priorities are numbered `0 ..
/// NUM_PRIORITIES`, and **lower numbers are more important.** The last
/// level is reserved for the idle task.
pub const NUM_PRIORITIES: usize = 16;

/// Capacity of the task table. Ids are never reused, so this bounds the
/// number of tasks ever initialized, not just the number alive at once.
pub const MAX_TASKS: usize = 16;

/// Smallest usable stack: the initial register frame alone needs 64 bytes.
pub const MIN_STACK_SIZE: usize = 64;

/// Priority of the idle task, the least important level in the system.
pub const IDLE_PRIORITY: Priority = Priority((NUM_PRIORITIES - 1) as u8);

/// Wrapper type for a task priority.
///
/// Priorities are small numbers, and **lower numbers are more important**.
/// It's easy to get this backwards when comparing raw numbers, so
/// comparisons go through `is_more_important_than`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Name by which a task is addressed after `init_task`. Doubles as the
/// task-table index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct TaskId(pub(crate) u8);

impl TaskId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Scheduling states a task moves through.
///
/// Exactly one task is `Running` at any instant once the scheduler has
/// started. A `Ready` task sits in the ready queue at its priority; a
/// `Sleeping` task sits in the sleep queue; a `Waiting` task sits in one
/// resource's waiter queue. `Suspended` and `Stopped` tasks sit in no
/// queue at all.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Stopped,
    Ready,
    Running,
    Sleeping,
    Suspended,
    Waiting,
}

/// Internal representation of a task.
///
/// Most fields are private to the kernel so the queue invariants can't be
/// broken from outside; the accessors below expose the diagnostic-facing
/// parts.
#[repr(C)] // so the location of SavedState is predictable
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the task while it is not running.
    // NOTE: it is critical that this field appear first!
    pub(crate) save: crate::arch::SavedState,

    pub(crate) id: TaskId,
    pub(crate) name: &'static str,
    pub(crate) priority: Priority,
    pub(crate) state: TaskState,

    pub(crate) entry: fn(usize),
    pub(crate) entry_arg: usize,

    /// Deadline for a `Sleeping` task, in kernel time.
    pub(crate) wakeup_tick: Timestamp,

    /// Link used by whichever queue currently holds the task: the ready
    /// queue at its priority, the sleep queue, or one resource's waiter
    /// queue. A task is in at most one of those at a time.
    pub(crate) link: Option<TaskId>,
    /// Neighbors in the insertion-ordered list of all live tasks, used
    /// only for enumeration.
    pub(crate) all_prev: Option<TaskId>,
    pub(crate) all_next: Option<TaskId>,

    /// Bottom of the task's stack region and the usable byte count above
    /// it, after the top was rounded down to the 8-byte alignment the ABI
    /// requires.
    pub(crate) stack_base: usize,
    pub(crate) stack_size: usize,

    /// Opaque per-task runtime context, published to the current-task
    /// context global on every switch so a C runtime shim can keep e.g.
    /// its reentrancy state (errno, stdio) per task. The kernel attaches
    /// no meaning to it.
    pub(crate) runtime_ctx: *mut core::ffi::c_void,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn runtime_ctx(&self) -> *mut core::ffi::c_void {
        self.runtime_ctx
    }
}

/// The task arena. Slot `i` holds the task with id `i`; slots at and past
/// `count` are vacant.
#[derive(Debug)]
pub(crate) struct TaskTable {
    slots: [Option<Task>; MAX_TASKS],
    count: usize,
}

impl TaskTable {
    pub(crate) const fn new() -> Self {
        const VACANT: Option<Task> = None;
        Self {
            slots: [VACANT; MAX_TASKS],
            count: 0,
        }
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        id.index() < self.count
    }

    /// Looks up a live task. A miss means a queue held an id the table
    /// never issued, which is state corruption; halt.
    pub(crate) fn task(&self, id: TaskId) -> &Task {
        match self.slots[id.index()] {
            Some(ref t) => t,
            None => panic!("task table corrupt"),
        }
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> &mut Task {
        match self.slots[id.index()] {
            Some(ref mut t) => t,
            None => panic!("task table corrupt"),
        }
    }

    /// Claims the next slot and fills it with the task `mk` builds for the
    /// assigned id. `None` when the table is full.
    pub(crate) fn insert(
        &mut self,
        mk: impl FnOnce(TaskId) -> Task,
    ) -> Option<TaskId> {
        if self.count == MAX_TASKS {
            return None;
        }
        let id = TaskId(self.count as u8);
        self.slots[self.count] = Some(mk(id));
        self.count += 1;
        Some(id)
    }
}

impl Kernel {
    /// Seeds a fresh TCB and its initial stack frame; see `init_task` for
    /// the public contract.
    pub(crate) fn init_task(
        &mut self,
        name: &'static str,
        stack: &'static mut [u8],
        priority: Priority,
        entry: fn(usize),
        entry_arg: usize,
    ) -> Result<TaskId, TaskError> {
        if usize::from(priority.0) >= NUM_PRIORITIES {
            return Err(TaskError::InvalidArgument);
        }

        // The ABI insists on an 8-byte-aligned stack. Rather than reject a
        // misaligned region, round the top down and let the task run with
        // slightly less room.
        let base = stack.as_mut_ptr() as usize;
        let top = (base + stack.len()) & !0x7;
        if top < base || top - base < MIN_STACK_SIZE {
            return Err(TaskError::InvalidArgument);
        }

        let id = self
            .tasks
            .insert(|id| Task {
                save: Default::default(),
                id,
                name,
                priority,
                state: TaskState::Stopped,
                entry,
                entry_arg,
                wakeup_tick: Timestamp::ZERO,
                link: None,
                all_prev: None,
                all_next: None,
                stack_base: base,
                stack_size: top - base,
                runtime_ctx: ptr::null_mut(),
            })
            .ok_or(TaskError::InvalidArgument)?;

        crate::arch::reinitialize(self.tasks.task_mut(id));
        Ok(id)
    }

    /// Moves a stopped task into the scheduled world: links it into the
    /// all-tasks list and the ready queue at its priority.
    pub(crate) fn add_task(&mut self, id: TaskId) -> Result<(), TaskError> {
        if !self.tasks.contains(id) {
            return Err(TaskError::InvalidArgument);
        }
        if self.tasks.task(id).state != TaskState::Stopped {
            return Err(TaskError::WrongState);
        }
        self.tasks.task_mut(id).state = TaskState::Ready;
        self.link_all_tail(id);
        crate::sched::ready_push_tail(&mut self.tasks, &mut self.sched, id);
        Ok(())
    }

    /// Puts the running task to sleep until `ticks` ticks from now.
    pub(crate) fn sleep_current(&mut self, ticks: u64) {
        let cur = self.current_id();
        let t = self.tasks.task_mut(cur);
        t.wakeup_tick = self.tick_count + ticks;
        t.state = TaskState::Sleeping;
        crate::sched::sleep_insert(&mut self.tasks, &mut self.sched, cur);
    }

    /// Marks the running task suspended. It sits in no queue until
    /// `unsuspend` re-queues it.
    pub(crate) fn suspend_current(&mut self) {
        let cur = self.current_id();
        self.tasks.task_mut(cur).state = TaskState::Suspended;
    }

    /// Makes a suspended task ready again. Reports whether the caller
    /// should request a reschedule because the revived task outranks the
    /// running one.
    pub(crate) fn unsuspend(
        &mut self,
        id: TaskId,
    ) -> Result<NextTask, TaskError> {
        if !self.tasks.contains(id) {
            return Err(TaskError::InvalidArgument);
        }
        if self.tasks.task(id).state != TaskState::Suspended {
            return Err(TaskError::WrongState);
        }
        self.tasks.task_mut(id).state = TaskState::Ready;
        crate::sched::ready_push_tail(&mut self.tasks, &mut self.sched, id);

        if let Some(cur) = self.current {
            let revived = self.tasks.task(id).priority;
            if revived.is_more_important_than(self.tasks.task(cur).priority) {
                return Ok(NextTask::Other);
            }
        }
        Ok(NextTask::Same)
    }

    /// Ends the running task: unlinks it from the all-tasks list and marks
    /// it stopped. The task keeps running until the caller requests a
    /// reschedule, after which nothing ever queues it again.
    pub(crate) fn retire_current(&mut self) {
        let cur = self.current_id();
        self.unlink_all(cur);
        self.tasks.task_mut(cur).state = TaskState::Stopped;
    }

    pub(crate) fn set_runtime_ctx(
        &mut self,
        id: TaskId,
        ctx: *mut core::ffi::c_void,
    ) -> Result<(), TaskError> {
        if !self.tasks.contains(id) {
            return Err(TaskError::InvalidArgument);
        }
        self.tasks.task_mut(id).runtime_ctx = ctx;
        Ok(())
    }

    fn link_all_tail(&mut self, id: TaskId) {
        match self.all_tail {
            None => {
                self.all_head = Some(id);
                self.all_tail = Some(id);
            }
            Some(tail) => {
                self.tasks.task_mut(tail).all_next = Some(id);
                self.tasks.task_mut(id).all_prev = Some(tail);
                self.all_tail = Some(id);
            }
        }
    }

    fn unlink_all(&mut self, id: TaskId) {
        let (prev, next) = {
            let t = self.tasks.task_mut(id);
            let pair = (t.all_prev, t.all_next);
            t.all_prev = None;
            t.all_next = None;
            pair
        };
        match prev {
            Some(p) => self.tasks.task_mut(p).all_next = next,
            None => self.all_head = next,
        }
        match next {
            Some(n) => self.tasks.task_mut(n).all_prev = prev,
            None => self.all_tail = prev,
        }
    }
}

/// Prepares a task for scheduling without starting it.
///
/// `stack` is the memory the task will execute on; the top gets rounded
/// down to 8-byte alignment and must leave at least [`MIN_STACK_SIZE`]
/// usable bytes. The top 16 words are seeded with a synthetic register
/// frame that makes the task's first dispatch enter the kernel trampoline,
/// which calls `entry(entry_arg)`.
///
/// The task is left `Stopped`; call [`add_task`] to schedule it.
pub fn init_task(
    name: &'static str,
    stack: &'static mut [u8],
    priority: Priority,
    entry: fn(usize),
    entry_arg: usize,
) -> Result<TaskId, TaskError> {
    with_kernel(|k| k.init_task(name, stack, priority, entry, entry_arg))
}

/// Schedules a task previously prepared by [`init_task`] (or one that has
/// since run to completion).
pub fn add_task(id: TaskId) -> Result<(), TaskError> {
    with_kernel(|k| k.add_task(id))
}

/// Requests a reschedule. The running task goes to the tail of its ready
/// queue, so equal-priority peers get their turn. Safe from interrupt
/// handlers.
pub fn yield_now() {
    crate::arch::pend_context_switch();
}

/// Deschedules the running task for at least `ticks` ticks. Task context
/// only.
pub fn sleep(ticks: u64) {
    with_kernel(|k| {
        k.sleep_current(ticks);
        crate::arch::pend_context_switch();
    });
}

/// Deschedules the running task until some other context calls
/// [`unsuspend`] on it. Task context only.
pub fn suspend_self() {
    with_kernel(|k| {
        k.suspend_current();
        crate::arch::pend_context_switch();
    });
}

/// Makes a suspended task ready again, preempting the caller if the
/// revived task is more important. Safe from interrupt handlers.
pub fn unsuspend(id: TaskId) -> Result<(), TaskError> {
    with_kernel(|k| {
        if k.unsuspend(id)? == NextTask::Other {
            crate::arch::pend_context_switch();
        }
        Ok(())
    })
}

/// The current kernel time.
pub fn now() -> Timestamp {
    with_kernel(|k| k.tick_count)
}

/// Id of the running task. `None` before the scheduler starts.
pub fn current_task_id() -> Option<TaskId> {
    with_kernel(|k| k.current)
}

/// Attaches an opaque runtime-context pointer to a task; see
/// `Task::runtime_ctx`.
pub fn set_runtime_context(
    id: TaskId,
    ctx: *mut core::ffi::c_void,
) -> Result<(), TaskError> {
    with_kernel(|k| k.set_runtime_ctx(id, ctx))
}

/// Runs `body` once per live task, in registration order. Runs inside the
/// kernel critical section, so keep `body` short.
pub fn for_each_task(mut body: impl FnMut(&Task)) {
    with_kernel(|k| {
        let mut cursor = k.all_head;
        while let Some(id) = cursor {
            let t = k.tasks.task(id);
            body(t);
            cursor = t.all_next;
        }
    });
}

/// Busy-waits at least `us` microseconds against the tick hardware,
/// without descheduling. For short delays below the tick resolution.
pub fn wait_microseconds(us: u32) {
    crate::arch::busy_wait_us(us);
}

/// First-dispatch entry for every task. The synthetic frame built by
/// `arch::reinitialize` lands here with the task's id in the first
/// argument register.
#[cfg(target_arch = "arm")]
pub(crate) extern "C" fn task_entry_trampoline(index: u32) -> ! {
    let (entry, arg) = with_kernel(|k| {
        let t = k.tasks.task(TaskId(index as u8));
        (t.entry, t.entry_arg)
    });
    entry(arg);

    // The task function returned; take it out of circulation. The pended
    // switch fires as soon as the mask drops, and nothing schedules this
    // task again.
    with_kernel(|k| {
        k.retire_current();
        crate::arch::pend_context_switch();
    });
    loop {
        crate::arch::wait_for_interrupt();
    }
}

/// Landing pad wired into the synthetic frame's link register. The
/// trampoline never returns, so reaching this means the frame discipline
/// broke.
#[cfg(target_arch = "arm")]
pub(crate) extern "C" fn task_return_trap() -> ! {
    panic!("task returned past its trampoline");
}
